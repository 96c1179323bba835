//! Indented line buffer shared by the backends

/// Line-oriented source writer
///
/// Blank lines carry no indentation. Child buffers start at the parent's
/// indentation so hoisted code can be rendered ahead of the line that uses it.
#[derive(Debug, Clone)]
pub struct SourceBuffer {
    lines: Vec<String>,
    indent: usize,
    unit: &'static str,
}

impl SourceBuffer {
    pub fn new(unit: &'static str) -> Self {
        Self {
            lines: Vec::new(),
            indent: 0,
            unit,
        }
    }

    /// Empty buffer at the same indentation
    pub fn child(&self) -> Self {
        Self {
            lines: Vec::new(),
            indent: self.indent,
            unit: self.unit,
        }
    }

    pub fn line(&mut self, text: impl AsRef<str>) {
        let text = text.as_ref();
        if text.is_empty() {
            self.lines.push(String::new());
        } else {
            self.lines
                .push(format!("{}{}", self.unit.repeat(self.indent), text));
        }
    }

    pub fn blank(&mut self) {
        if self.lines.last().is_some_and(|l| !l.is_empty()) {
            self.lines.push(String::new());
        }
    }

    pub fn indent(&mut self) {
        self.indent += 1;
    }

    pub fn dedent(&mut self) {
        self.indent = self.indent.saturating_sub(1);
    }

    /// Writes the lines produced by `f` one level deeper
    pub fn indented(&mut self, f: impl FnOnce(&mut Self)) {
        self.indent();
        f(self);
        self.dedent();
    }

    /// Moves the lines of `other` to the end of this buffer, as written
    pub fn append(&mut self, other: SourceBuffer) {
        self.lines.extend(other.lines);
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Lines joined with `\n`, trailing blank lines removed, ending in a newline
    pub fn finish(mut self) -> String {
        while self.lines.last().is_some_and(|l| l.is_empty()) {
            self.lines.pop();
        }
        let mut out = self.lines.join("\n");
        out.push('\n');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indentation() {
        let mut buf = SourceBuffer::new("    ");
        buf.line("def f():");
        buf.indented(|b| b.line("return 1"));
        buf.blank();
        buf.blank();
        assert_eq!(buf.finish(), "def f():\n    return 1\n");
    }

    #[test]
    fn test_child_keeps_indentation() {
        let mut buf = SourceBuffer::new("  ");
        buf.line("function f() {");
        buf.indent();
        let mut hoisted = buf.child();
        hoisted.line("const __match_0 = (s) => s;");
        buf.append(hoisted);
        buf.line("return __match_0(x);");
        buf.dedent();
        buf.line("}");
        assert_eq!(
            buf.finish(),
            "function f() {\n  const __match_0 = (s) => s;\n  return __match_0(x);\n}\n"
        );
    }
}
