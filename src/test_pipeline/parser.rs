//! Parser for test pipeline method definitions.

use super::{TestMethod, TestType};

pub fn parse_methods(text: &str) -> Result<Vec<TestMethod>, String> {
    Parser::new(text).parse()
}

struct Parser<'a> {
    lines: std::iter::Enumerate<std::str::Lines<'a>>,
    methods: Vec<TestMethod>,
}

/// Strip a trailing `;` comment and surrounding whitespace.
fn strip_comment(line: &str) -> &str {
    line.split(';').next().unwrap_or("").trim()
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '!')
}

fn parse_type(name: &str) -> Result<TestType, String> {
    TestType::parse(name.trim()).ok_or_else(|| format!("unknown type '{}'", name.trim()))
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            lines: text.lines().enumerate(),
            methods: Vec::new(),
        }
    }

    fn parse(mut self) -> Result<Vec<TestMethod>, String> {
        while let Some((index, line)) = self.lines.next() {
            let line = strip_comment(line);
            if line.is_empty() {
                continue;
            }
            let method = self
                .parse_method(line)
                .map_err(|e| format!("line {}: {}", index + 1, e))?;
            self.methods.push(method);
        }
        Ok(self.methods)
    }

    /// Parse one method starting at its header line; consumes the body.
    fn parse_method(&mut self, header: &str) -> Result<TestMethod, String> {
        let (kernel, rest) = if let Some(rest) = header.strip_prefix("kernel ") {
            (true, rest)
        } else if let Some(rest) = header.strip_prefix("function ") {
            (false, rest)
        } else {
            return Err(format!("expected 'kernel' or 'function', found '{}'", header));
        };

        let rest = rest
            .strip_suffix('{')
            .ok_or("expected '{' at end of method header")?
            .trim();
        let open = rest.find('(').ok_or("expected '(' after method name")?;
        let close = rest.rfind(')').ok_or("expected ')' after parameters")?;
        if close < open {
            return Err("mismatched parentheses".to_string());
        }

        let name = rest[..open].trim();
        if !is_identifier(name) {
            return Err(format!("invalid method name '{}'", name));
        }

        let params = self.parse_params(&rest[open + 1..close])?;

        let suffix = rest[close + 1..].trim();
        let returns = if suffix.is_empty() {
            None
        } else {
            let ty = suffix
                .strip_prefix("::")
                .ok_or_else(|| format!("unexpected '{}' after parameters", suffix))?;
            Some(parse_type(ty)?)
        };
        if kernel && returns.is_some() {
            return Err(format!("kernel {} cannot declare a return type", name));
        }

        let body = self.parse_body()?;
        Ok(TestMethod {
            name: name.to_string(),
            params,
            returns,
            body,
        })
    }

    fn parse_params(&self, text: &str) -> Result<Vec<(String, TestType)>, String> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        text.split(',')
            .map(|param| {
                let (name, ty) = param
                    .split_once("::")
                    .ok_or_else(|| format!("parameter '{}' has no type", param.trim()))?;
                let name = name.trim();
                if !is_identifier(name) {
                    return Err(format!("invalid parameter name '{}'", name));
                }
                Ok((name.to_string(), parse_type(ty)?))
            })
            .collect()
    }

    fn parse_body(&mut self) -> Result<Vec<String>, String> {
        let mut body = Vec::new();
        for (_, line) in self.lines.by_ref() {
            let line = strip_comment(line);
            if line == "}" {
                return Ok(body);
            }
            if !line.is_empty() {
                body.push(line.to_string());
            }
        }
        Err("unterminated method body".to_string())
    }
}
