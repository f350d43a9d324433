//! TCL source parser used by the static analyzer
//!
//! Produces a light syntax tree: a script is a list of commands, a command is a
//! list of words, and each unbraced word is a list of literal, variable and
//! command-substitution parts. Braced words are kept verbatim so callers decide
//! whether a brace body is a script, an expression or plain data.

use std::fmt;

/// Error raised when source text is not well-formed TCL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
    pub line: usize,
}

impl ParseError {
    fn new(message: impl Into<String>, line: usize) -> Self {
        Self {
            message: message.into(),
            line,
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for ParseError {}

/// A parsed script
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub commands: Vec<Command>,
}

/// A single command invocation
#[derive(Debug, Clone)]
pub struct Command {
    pub words: Vec<Word>,
    pub line: usize,
}

impl Command {
    /// Literal command name, without a leading `::`
    pub fn name(&self) -> Option<String> {
        let first = self.words.first()?;
        let literal = first.literal()?;
        Some(literal.trim_start_matches("::").to_string())
    }

    /// Literal text of the word at `index`
    pub fn literal_arg(&self, index: usize) -> Option<String> {
        self.words.get(index).and_then(Word::literal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordKind {
    Bare,
    Quoted,
    Braced,
}

/// A word of a command
#[derive(Debug, Clone)]
pub struct Word {
    pub kind: WordKind,
    /// Raw source text of the word (without enclosing braces or quotes)
    pub text: String,
    pub parts: Vec<Part>,
    pub line: usize,
    /// Word was prefixed with `{*}`
    pub expanded: bool,
}

impl Word {
    /// Literal value when the word contains no substitutions
    pub fn literal(&self) -> Option<String> {
        if self.kind == WordKind::Braced {
            return Some(self.text.clone());
        }

        let mut value = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(text) => value.push_str(text),
                _ => return None,
            }
        }
        Some(value)
    }

    pub fn is_braced(&self) -> bool {
        self.kind == WordKind::Braced
    }
}

/// Piece of an unbraced word
#[derive(Debug, Clone)]
pub enum Part {
    Literal(String),
    Variable {
        name: String,
        index: Option<Vec<Part>>,
    },
    Command(Script),
}

/// Parameter declared by a `proc`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcParam {
    pub name: String,
    pub default: Option<String>,
}

/// Signature of a `proc` found in a script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcSignature {
    pub name: String,
    pub params: Vec<ProcParam>,
    /// Last parameter is the variadic `args`
    pub variadic: bool,
}

/// Parse a complete script
pub fn parse(source: &str) -> Result<Script, ParseError> {
    let mut parser = Parser::new(source);
    parser.parse_script(false)
}

/// Parse free text (e.g. an `expr` body) for `$var` and `[cmd]` substitutions
pub fn parse_substitutions(text: &str) -> Result<Vec<Part>, ParseError> {
    let mut parser = Parser::new(text);
    parser.parse_parts(Until::End)
}

/// Split a TCL list into its elements (no substitutions)
pub fn parse_list(text: &str) -> Result<Vec<String>, ParseError> {
    let chars: Vec<char> = text.chars().collect();
    let mut elements = Vec::new();
    let mut pos = 0;
    let mut line = 1;

    loop {
        while pos < chars.len() && chars[pos].is_whitespace() {
            if chars[pos] == '\n' {
                line += 1;
            }
            pos += 1;
        }
        if pos >= chars.len() {
            break;
        }

        let mut element = String::new();
        match chars[pos] {
            '{' => {
                let open_line = line;
                let mut depth = 1;
                pos += 1;
                loop {
                    let Some(&c) = chars.get(pos) else {
                        return Err(ParseError::new("unmatched open brace in list", open_line));
                    };
                    pos += 1;
                    match c {
                        '\\' => {
                            element.push(c);
                            if let Some(&next) = chars.get(pos) {
                                element.push(next);
                                pos += 1;
                            }
                            continue;
                        }
                        '{' => depth += 1,
                        '}' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        '\n' => line += 1,
                        _ => {}
                    }
                    element.push(c);
                }
                if pos < chars.len() && !chars[pos].is_whitespace() {
                    return Err(ParseError::new(
                        "list element in braces followed by non-whitespace",
                        line,
                    ));
                }
            }
            '"' => {
                let open_line = line;
                pos += 1;
                loop {
                    let Some(&c) = chars.get(pos) else {
                        return Err(ParseError::new("unmatched open quote in list", open_line));
                    };
                    pos += 1;
                    match c {
                        '"' => break,
                        '\\' => {
                            if let Some(&next) = chars.get(pos) {
                                element.push(unescape(next));
                                pos += 1;
                            }
                        }
                        '\n' => {
                            line += 1;
                            element.push(c);
                        }
                        _ => element.push(c),
                    }
                }
                if pos < chars.len() && !chars[pos].is_whitespace() {
                    return Err(ParseError::new(
                        "list element in quotes followed by non-whitespace",
                        line,
                    ));
                }
            }
            _ => {
                while pos < chars.len() && !chars[pos].is_whitespace() {
                    if chars[pos] == '\\' && pos + 1 < chars.len() {
                        element.push(unescape(chars[pos + 1]));
                        pos += 2;
                    } else {
                        element.push(chars[pos]);
                        pos += 1;
                    }
                }
            }
        }
        elements.push(element);
    }

    Ok(elements)
}

/// Find the top-level `proc` named `name` and describe its parameters
pub fn find_proc(script: &Script, name: &str) -> Option<ProcSignature> {
    let wanted = name.trim_start_matches("::");

    for command in &script.commands {
        if command.name().as_deref() != Some("proc") || command.words.len() != 4 {
            continue;
        }
        let Some(proc_name) = command.literal_arg(1) else {
            continue;
        };
        if proc_name.trim_start_matches("::") != wanted {
            continue;
        }

        let arg_spec = command.literal_arg(2)?;
        let mut params = Vec::new();
        for element in parse_list(&arg_spec).ok()? {
            let mut pieces = parse_list(&element).ok()?.into_iter();
            let param_name = pieces.next()?;
            params.push(ProcParam {
                name: param_name,
                default: pieces.next(),
            });
        }
        let variadic = params.last().map(|p| p.name == "args").unwrap_or(false);

        return Some(ProcSignature {
            name: wanted.to_string(),
            params,
            variadic,
        });
    }

    None
}

fn unescape(c: char) -> char {
    match c {
        'n' => '\n',
        't' => '\t',
        'r' => '\r',
        '0' => '\0',
        other => other,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Until {
    /// Unquoted word; `nested` when inside `[...]`
    Word { nested: bool },
    Quote,
    Paren,
    End,
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
    line: usize,
}

impl Parser {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn at_line_continuation(&self) -> bool {
        self.peek() == Some('\\') && self.peek_at(1) == Some('\n')
    }

    fn parse_script(&mut self, nested: bool) -> Result<Script, ParseError> {
        let start_line = self.line;
        let mut script = Script::default();

        loop {
            self.skip_separators();

            let Some(c) = self.peek() else {
                if nested {
                    return Err(ParseError::new("missing close-bracket", start_line));
                }
                break;
            };

            if nested && c == ']' {
                self.pos += 1;
                break;
            }

            if c == '#' {
                self.skip_comment();
                continue;
            }

            let command = self.parse_command(nested)?;
            if !command.words.is_empty() {
                script.commands.push(command);
            }
        }

        Ok(script)
    }

    fn skip_separators(&mut self) {
        while let Some(c) = self.peek() {
            match c {
                ' ' | '\t' | '\r' | ';' => self.pos += 1,
                '\n' => {
                    self.line += 1;
                    self.pos += 1;
                }
                '\\' if self.peek_at(1) == Some('\n') => {
                    self.line += 1;
                    self.pos += 2;
                }
                _ => break,
            }
        }
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\\' && self.peek_at(1).is_some() {
                if self.peek_at(1) == Some('\n') {
                    self.line += 1;
                }
                self.pos += 2;
                continue;
            }
            if c == '\n' {
                break;
            }
            self.pos += 1;
        }
    }

    fn parse_command(&mut self, nested: bool) -> Result<Command, ParseError> {
        let line = self.line;
        let mut words = Vec::new();

        loop {
            while let Some(c) = self.peek() {
                if c == ' ' || c == '\t' || c == '\r' {
                    self.pos += 1;
                } else if self.at_line_continuation() {
                    self.line += 1;
                    self.pos += 2;
                } else {
                    break;
                }
            }

            match self.peek() {
                None | Some('\n') | Some(';') => break,
                Some(']') if nested => break,
                Some(_) => words.push(self.parse_word(nested)?),
            }
        }

        Ok(Command { words, line })
    }

    fn parse_word(&mut self, nested: bool) -> Result<Word, ParseError> {
        let line = self.line;
        let mut expanded = false;

        if self.peek() == Some('{')
            && self.peek_at(1) == Some('*')
            && self.peek_at(2) == Some('}')
            && self.peek_at(3).map(|c| !c.is_whitespace()).unwrap_or(false)
        {
            self.pos += 3;
            expanded = true;
        }

        let word = match self.peek() {
            Some('{') => {
                let text = self.parse_braced()?;
                self.check_word_end(nested, "brace")?;
                Word {
                    kind: WordKind::Braced,
                    parts: vec![Part::Literal(text.clone())],
                    text,
                    line,
                    expanded,
                }
            }
            Some('"') => {
                self.pos += 1;
                let start = self.pos;
                let parts = self.parse_parts(Until::Quote)?;
                // closing quote already consumed
                let text: String = self.chars[start..self.pos - 1].iter().collect();
                self.check_word_end(nested, "quote")?;
                Word {
                    kind: WordKind::Quoted,
                    text,
                    parts,
                    line,
                    expanded,
                }
            }
            _ => {
                let start = self.pos;
                let parts = self.parse_parts(Until::Word { nested })?;
                let text: String = self.chars[start..self.pos].iter().collect();
                Word {
                    kind: WordKind::Bare,
                    text,
                    parts,
                    line,
                    expanded,
                }
            }
        };
        Ok(word)
    }

    fn check_word_end(&self, nested: bool, what: &str) -> Result<(), ParseError> {
        match self.peek() {
            None | Some(' ') | Some('\t') | Some('\r') | Some('\n') | Some(';') => Ok(()),
            Some(']') if nested => Ok(()),
            Some('\\') if self.peek_at(1) == Some('\n') => Ok(()),
            Some(_) => Err(ParseError::new(
                format!("extra characters after close-{}", what),
                self.line,
            )),
        }
    }

    fn parse_braced(&mut self) -> Result<String, ParseError> {
        let open_line = self.line;
        let mut depth = 1;
        let mut text = String::new();
        self.pos += 1;

        loop {
            let Some(c) = self.peek() else {
                return Err(ParseError::new("missing close-brace", open_line));
            };
            self.pos += 1;

            match c {
                '\\' => {
                    text.push(c);
                    if let Some(next) = self.peek() {
                        if next == '\n' {
                            self.line += 1;
                        }
                        text.push(next);
                        self.pos += 1;
                    }
                    continue;
                }
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(text);
                    }
                }
                '\n' => self.line += 1,
                _ => {}
            }
            text.push(c);
        }
    }

    fn parse_parts(&mut self, until: Until) -> Result<Vec<Part>, ParseError> {
        let open_line = self.line;
        let mut parts = Vec::new();
        let mut literal = String::new();

        loop {
            let Some(c) = self.peek() else {
                match until {
                    Until::Quote => return Err(ParseError::new("missing \"", open_line)),
                    Until::Paren => return Err(ParseError::new("missing )", open_line)),
                    _ => break,
                }
            };

            match until {
                Until::Quote if c == '"' => {
                    self.pos += 1;
                    break;
                }
                Until::Paren if c == ')' => {
                    self.pos += 1;
                    break;
                }
                Until::Word { nested } => {
                    if matches!(c, ' ' | '\t' | '\r' | '\n' | ';') || (nested && c == ']') {
                        break;
                    }
                    if self.at_line_continuation() {
                        break;
                    }
                }
                _ => {}
            }

            match c {
                '\\' => {
                    self.pos += 1;
                    if let Some(next) = self.peek() {
                        self.pos += 1;
                        if next == '\n' {
                            self.line += 1;
                            literal.push(' ');
                        } else {
                            literal.push(unescape(next));
                        }
                    } else {
                        literal.push('\\');
                    }
                }
                '$' => {
                    self.pos += 1;
                    match self.parse_variable()? {
                        Some(part) => {
                            if !literal.is_empty() {
                                parts.push(Part::Literal(std::mem::take(&mut literal)));
                            }
                            parts.push(part);
                        }
                        None => literal.push('$'),
                    }
                }
                '[' => {
                    self.pos += 1;
                    let script = self.parse_script(true)?;
                    if !literal.is_empty() {
                        parts.push(Part::Literal(std::mem::take(&mut literal)));
                    }
                    parts.push(Part::Command(script));
                }
                '\n' => {
                    self.line += 1;
                    self.pos += 1;
                    literal.push(c);
                }
                _ => {
                    self.pos += 1;
                    literal.push(c);
                }
            }
        }

        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }
        Ok(parts)
    }

    fn parse_variable(&mut self) -> Result<Option<Part>, ParseError> {
        if self.peek() == Some('{') {
            let open_line = self.line;
            self.pos += 1;
            let mut name = String::new();
            loop {
                match self.peek() {
                    None => {
                        return Err(ParseError::new(
                            "missing close-brace for variable name",
                            open_line,
                        ))
                    }
                    Some('}') => {
                        self.pos += 1;
                        break;
                    }
                    Some(c) => {
                        if c == '\n' {
                            self.line += 1;
                        }
                        name.push(c);
                        self.pos += 1;
                    }
                }
            }
            return Ok(Some(Part::Variable { name, index: None }));
        }

        let mut name = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                name.push(c);
                self.pos += 1;
            } else if c == ':' && self.peek_at(1) == Some(':') {
                name.push_str("::");
                self.pos += 2;
            } else {
                break;
            }
        }

        if name.is_empty() {
            return Ok(None);
        }

        let index = if self.peek() == Some('(') {
            self.pos += 1;
            Some(self.parse_parts(Until::Paren)?)
        } else {
            None
        };

        Ok(Some(Part::Variable { name, index }))
    }
}
