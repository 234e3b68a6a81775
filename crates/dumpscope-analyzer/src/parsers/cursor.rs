//! Forward-only token cursor over one output line

/// Walks a line left to right. Every method either consumes what it matched
/// or leaves the position where it was, so callers can try alternatives.
#[derive(Debug, Clone, Copy)]
pub struct Cursor<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    /// Unconsumed input, untrimmed
    pub fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    /// Only whitespace remains
    pub fn is_at_end(&self) -> bool {
        self.rest().trim().is_empty()
    }

    pub fn skip_ws(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start().len();
    }

    /// Next whitespace-delimited token
    pub fn token(&mut self) -> Option<&'a str> {
        self.skip_ws();
        let rest = self.rest();
        if rest.is_empty() {
            return None;
        }
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        self.pos += end;
        Some(&rest[..end])
    }

    /// Next token without consuming it
    pub fn peek(&self) -> Option<&'a str> {
        let mut lookahead = *self;
        lookahead.token()
    }

    /// Consume `expected` (after optional whitespace) if it comes next
    pub fn literal(&mut self, expected: &str) -> bool {
        let mut lookahead = *self;
        lookahead.skip_ws();
        if lookahead.rest().starts_with(expected) {
            self.pos = lookahead.pos + expected.len();
            true
        } else {
            false
        }
    }

    /// Hexadecimal token; see [`parse_hex`]
    pub fn hex_u64(&mut self) -> Option<u64> {
        self.map_token(parse_hex)
    }

    /// Decimal token; thousands separators are accepted
    pub fn dec_u64(&mut self) -> Option<u64> {
        self.map_token(parse_dec)
    }

    pub fn dec_i64(&mut self) -> Option<i64> {
        self.map_token(|token| match token.strip_prefix('-') {
            Some(digits) => parse_dec(digits)
                .and_then(|v| i64::try_from(v).ok())
                .map(|v| -v),
            None => parse_dec(token).and_then(|v| i64::try_from(v).ok()),
        })
    }

    /// Trimmed remainder, `None` when empty; consumes everything
    pub fn remainder(&mut self) -> Option<&'a str> {
        let rest = self.rest().trim();
        self.pos = self.text.len();
        (!rest.is_empty()).then_some(rest)
    }

    fn map_token<T>(&mut self, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
        let mut lookahead = *self;
        let value = parse(lookahead.token()?)?;
        *self = lookahead;
        Some(value)
    }
}

/// Parse a debugger hex number.
///
/// No prefix is the norm; `0x` is accepted, and so are WinDbg's backtick
/// separators (`00007ffe`12340000`). A trailing `:` (memory dump addresses)
/// and a decimal echo in parentheses (`0x1c(28)`) are ignored.
pub fn parse_hex(token: &str) -> Option<u64> {
    let token = token.trim_end_matches(':');
    let token = match token.find('(') {
        Some(open) if token.ends_with(')') => &token[..open],
        _ => token,
    };
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);

    let mut value: u64 = 0;
    let mut any = false;
    for c in digits.chars() {
        if c == '`' {
            continue;
        }
        let digit = c.to_digit(16)?;
        value = value.checked_mul(16)?.checked_add(u64::from(digit))?;
        any = true;
    }
    any.then_some(value)
}

/// Parse a decimal number, allowing `,` thousands separators
pub fn parse_dec(token: &str) -> Option<u64> {
    let mut value: u64 = 0;
    let mut any = false;
    for c in token.chars() {
        if c == ',' && any {
            continue;
        }
        let digit = c.to_digit(10)?;
        value = value.checked_mul(10)?.checked_add(u64::from(digit))?;
        any = true;
    }
    any.then_some(value)
}

/// Value of a `Label: value` line, trimmed. `None` if the label differs.
pub fn labeled<'a>(line: &'a str, label: &str) -> Option<&'a str> {
    let rest = line.trim_start().strip_prefix(label)?;
    let value = rest.trim_start().strip_prefix(':')?;
    Some(value.trim())
}
