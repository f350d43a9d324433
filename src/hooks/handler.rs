//! Hook handler trait

use crate::hooks::context::HookContext;
use crate::hooks::errors::HookError;
use crate::hooks::result::HookResult;

/// A unit of code registered against a hook type
///
/// Returning `Ok(None)` is an implicit success; the dispatcher synthesizes the
/// result. Errors and panics are turned into failed results by the dispatcher.
pub trait HookHandler: Send + Sync {
    fn call(&self, context: &mut HookContext) -> Result<Option<HookResult>, HookError>;

    fn name(&self) -> &str;
}

/// Adapter turning a closure into a [`HookHandler`]
pub struct FnHandler<F> {
    name: String,
    func: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&mut HookContext) -> Result<Option<HookResult>, HookError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> HookHandler for FnHandler<F>
where
    F: Fn(&mut HookContext) -> Result<Option<HookResult>, HookError> + Send + Sync,
{
    fn call(&self, context: &mut HookContext) -> Result<Option<HookResult>, HookError> {
        (self.func)(context)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::types::HookType;
    use serde_json::{json, Map};

    #[test]
    fn test_fn_handler() {
        let handler = FnHandler::new("tagger", |ctx: &mut HookContext| {
            ctx.modify("tagged", json!(true));
            Ok(None)
        });
        assert_eq!(handler.name(), "tagger");

        let mut context = HookContext::new(HookType::AfterProfile, Map::new(), Map::new());
        assert!(handler.call(&mut context).unwrap().is_none());
        assert_eq!(context.get("tagged"), Some(&json!(true)));
    }
}
