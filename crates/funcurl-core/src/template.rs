//! Template compiler.
//!
//! Translates a tag-annotated document into script source run by the
//! [`ScriptEngine`]:
//!
//! | Form | Meaning |
//! |------|---------|
//! | text | emitted literally |
//! | `<% code %>` | statement, emitted as-is |
//! | `<%= expr %>` | expression result emitted |
//! | `<%# ... %>` | comment, dropped |
//! | `${ expr }` | shorthand for `<%= expr %>` |
//!
//! The shorthand is rewritten first, tracking nested braces and quoted
//! strings so a `}` inside either does not end the expression.

use tracing::{error, instrument};

use funcurl_common::RuntimeError;

use crate::context::{RequestContext, ResponseState};
use crate::engine::{Invocation, RenderOutcome, ScriptEngine};
use crate::headers::ResponseHeaders;
use crate::mime;

/// Name of the emit sink inside compiled programs.
pub const OUT: &str = "$out";

/// Compiled script text for one template. Never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateProgram {
    script: String,
}

impl TemplateProgram {
    /// The generated script.
    pub fn script(&self) -> &str {
        &self.script
    }
}

/// Compiles templates and runs them in the shared engine.
#[derive(Debug, Clone)]
pub struct TemplateCompiler {
    engine: ScriptEngine,
}

impl TemplateCompiler {
    /// Create a compiler running programs in `engine`.
    pub fn new(engine: ScriptEngine) -> Self {
        Self { engine }
    }

    /// Translate template source into a program.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Script`] for an unterminated `<%` or `${`.
    pub fn compile(source: &str) -> Result<TemplateProgram, RuntimeError> {
        let source = source.replace('\r', "");
        let expanded = expand_shorthand(&source)?;
        Ok(TemplateProgram {
            script: translate_tags(&expanded)?,
        })
    }

    /// Run a compiled program against a request.
    ///
    /// Sets `content-type` to the request's HTML type when the program
    /// leaves it unset.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Script`] naming the template when the program
    /// fails.
    #[instrument(skip(self, program, request, state, headers))]
    pub async fn execute(
        &self,
        name: &str,
        program: &TemplateProgram,
        request: RequestContext,
        state: ResponseState,
        headers: ResponseHeaders,
    ) -> Result<RenderOutcome, RuntimeError> {
        let resolver = request.mime_resolver.clone();
        let invocation = Invocation {
            request,
            state,
            headers,
        };
        let mut outcome = self
            .engine
            .render(name, program.script(), &invocation)
            .await
            .map_err(|e| {
                error!(template = name, error = %e, "Template execution failed");
                match e {
                    RuntimeError::Script { message, .. } => RuntimeError::script(name, message),
                    other => other,
                }
            })?;

        if outcome.headers.content_type().is_none() {
            let html = mime::resolve(resolver.as_deref(), "html");
            outcome.headers.set_content_type(html.content_type);
        }
        Ok(outcome)
    }
}

fn compile_error(message: impl Into<String>) -> RuntimeError {
    RuntimeError::script("<template>", message)
}

fn expand_shorthand(source: &str) -> Result<String, RuntimeError> {
    let chars: Vec<char> = source.chars().collect();
    let mut out = String::with_capacity(source.len());
    let mut i = 0;

    while i < chars.len() {
        if chars[i] == '$' && chars.get(i + 1) == Some(&'{') {
            let start = i + 2;
            let mut depth = 1usize;
            let mut quote: Option<char> = None;
            let mut escaped = false;
            let mut j = start;
            let mut end = None;

            while j < chars.len() {
                let c = chars[j];
                if let Some(q) = quote {
                    if escaped {
                        escaped = false;
                    } else if c == '\\' {
                        escaped = true;
                    } else if c == q {
                        quote = None;
                    }
                } else {
                    match c {
                        '"' | '\'' | '`' => quote = Some(c),
                        '{' => depth += 1,
                        '}' => {
                            depth -= 1;
                            if depth == 0 {
                                end = Some(j);
                                break;
                            }
                        }
                        _ => {}
                    }
                }
                j += 1;
            }

            let end = end.ok_or_else(|| compile_error("unterminated ${ expression"))?;
            out.push_str("<%=");
            out.extend(&chars[start..end]);
            out.push_str("%>");
            i = end + 1;
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    Ok(out)
}

fn emit_literal(script: &mut String, text: &str) {
    if text.is_empty() {
        return;
    }
    // JSON string syntax is a valid JS string literal.
    let literal = serde_json::Value::String(text.to_string()).to_string();
    script.push_str(OUT);
    script.push('(');
    script.push_str(&literal);
    script.push_str(");\n");
}

fn translate_tags(source: &str) -> Result<String, RuntimeError> {
    let mut script = String::new();
    let mut rest = source;

    while let Some(open) = rest.find("<%") {
        emit_literal(&mut script, &rest[..open]);
        let after = &rest[open + 2..];
        let close = after
            .find("%>")
            .ok_or_else(|| compile_error(format!("unterminated tag at byte {}", source.len() - rest.len() + open)))?;
        let body = &after[..close];

        if let Some(expr) = body.strip_prefix('=') {
            let expr = expr.trim();
            let expr = expr.strip_suffix(';').map_or(expr, str::trim_end);
            script.push_str(OUT);
            script.push('(');
            script.push_str(expr);
            script.push_str(");\n");
        } else if !body.starts_with('#') {
            script.push_str(body.trim());
            script.push('\n');
        }
        rest = &after[close + 2..];
    }
    emit_literal(&mut script, rest);
    Ok(script)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_and_expression() {
        let program = TemplateCompiler::compile("<% let x=1; %>Hello <%= x+1 %>").unwrap();
        assert_eq!(program.script(), "let x=1;\n$out(\"Hello \");\n$out(x+1);\n");
    }

    #[test]
    fn test_comment_dropped() {
        let program = TemplateCompiler::compile("a<%# secret %>b").unwrap();
        assert_eq!(program.script(), "$out(\"a\");\n$out(\"b\");\n");
    }

    #[test]
    fn test_trailing_semicolon_trimmed() {
        let program = TemplateCompiler::compile("<%= name ; %>").unwrap();
        assert_eq!(program.script(), "$out(name);\n");
    }

    #[test]
    fn test_literal_escaping() {
        let program = TemplateCompiler::compile("line \"one\"\r\n\ttab\\").unwrap();
        assert_eq!(program.script(), "$out(\"line \\\"one\\\"\\n\\ttab\\\\\");\n");
    }

    #[test]
    fn test_shorthand_brace_and_quote_aware() {
        let program = TemplateCompiler::compile("<p>${ {a: '}'}.a + \"{\" }</p>").unwrap();
        assert_eq!(
            program.script(),
            "$out(\"<p>\");\n$out({a: '}'}.a + \"{\");\n$out(\"</p>\");\n"
        );
    }

    #[test]
    fn test_shorthand_escaped_quote() {
        let program = TemplateCompiler::compile(r#"${ "a\"}" }"#).unwrap();
        assert_eq!(program.script(), "$out(\"a\\\"}\");\n");
    }

    #[test]
    fn test_unterminated_forms() {
        assert!(TemplateCompiler::compile("a <% b").is_err());
        assert!(TemplateCompiler::compile("a ${ b").is_err());
        assert!(TemplateCompiler::compile("a ${ '}").is_err());
    }

    #[test]
    fn test_plain_dollar_is_literal() {
        let program = TemplateCompiler::compile("costs $5 {ok}").unwrap();
        assert_eq!(program.script(), "$out(\"costs $5 {ok}\");\n");
    }
}
