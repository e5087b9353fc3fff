//! Locating model-authored script blocks in assistant output.

/// Opening and closing delimiters around a script block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptSyntax {
    pub open: &'static str,
    pub close: &'static str,
    /// The upstream stop sequence swallows the closing delimiter, so the relay
    /// appends it itself.
    pub close_dangling: bool,
}

/// `<lua>...</lua>` tags.
pub const LUA_TAGS: ScriptSyntax = ScriptSyntax {
    open: "<lua>",
    close: "</lua>",
    close_dangling: false,
};

/// A fenced code block tagged `lua`.
pub const LUA_FENCE: ScriptSyntax = ScriptSyntax {
    open: "```lua",
    close: "```",
    close_dangling: true,
};

/// Source code extracted from one assistant reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptBlock {
    raw_code: String,
}

impl ScriptBlock {
    pub fn raw_code(&self) -> &str {
        &self.raw_code
    }
}

impl ScriptSyntax {
    /// Returns the text between the first opening delimiter and the first
    /// closing delimiter after it.
    pub fn extract(&self, text: &str) -> Option<ScriptBlock> {
        let code_start = text.find(self.open)? + self.open.len();
        let code_len = text[code_start..].find(self.close)?;
        Some(ScriptBlock {
            raw_code: text[code_start..code_start + code_len].to_string(),
        })
    }

    /// Suffix that closes an opened but unterminated block, when this syntax
    /// expects the relay to close it.
    pub fn dangling_suffix(&self, text: &str) -> Option<String> {
        if !self.close_dangling {
            return None;
        }
        let code_start = text.find(self.open)? + self.open.len();
        if text[code_start..].contains(self.close) {
            return None;
        }
        if text.ends_with('\n') {
            Some(self.close.to_string())
        } else {
            Some(format!("\n{}", self.close))
        }
    }
}
