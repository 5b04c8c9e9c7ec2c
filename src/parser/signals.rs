//! Inline script inspection using oxc_parser.
//!
//! Each inline body is parsed once to collect suspicious-construct signals and
//! the string specifiers it imports. When the parse reports errors (templated
//! or truncated markup is common) a pattern scan backs up the AST pass.

use oxc_allocator::Allocator;
use oxc_ast::ast::*;
use oxc_ast::visit::walk;
use oxc_ast::Visit;
use oxc_parser::Parser;
use oxc_span::SourceType;
use regex::Regex;
use std::collections::BTreeSet;
use tracing::trace;

pub const SIGNAL_EVAL: &str = "eval";
pub const SIGNAL_FUNCTION_CONSTRUCTOR: &str = "function_constructor";
pub const SIGNAL_STRING_TIMER: &str = "string_timer";
pub const SIGNAL_DOCUMENT_WRITE: &str = "document_write";
pub const SIGNAL_ATOB: &str = "atob";
pub const SIGNAL_FROM_CHAR_CODE: &str = "from_char_code";
pub const SIGNAL_HEX_ESCAPE: &str = "hex_escape";
pub const SIGNAL_UNESCAPE: &str = "unescape";

/// Result of inspecting one inline body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InlineAnalysis {
    pub signals: BTreeSet<String>,
    /// String specifiers from `import` declarations and `import()` calls.
    pub imports: Vec<String>,
}

/// Detector for suspicious constructs in inline scripts.
#[derive(Clone)]
pub struct SignalDetector {
    /// Always applied; these constructs are not visible as call shapes.
    textual: Vec<(&'static str, Regex)>,
    /// Applied only when the AST parse was incomplete.
    fallback: Vec<(&'static str, Regex)>,
}

impl SignalDetector {
    /// Create a detector with pre-compiled patterns.
    pub fn new() -> Self {
        Self {
            textual: vec![
                (SIGNAL_ATOB, Regex::new(r"\batob\s*\(").unwrap()),
                (
                    SIGNAL_FROM_CHAR_CODE,
                    Regex::new(r#"fromCharCode\s*\(|\[\s*["']fromCharCode["']\s*\]"#).unwrap(),
                ),
                (SIGNAL_HEX_ESCAPE, Regex::new(r"(?:\\x[0-9a-fA-F]{2}){4,}").unwrap()),
                (SIGNAL_UNESCAPE, Regex::new(r"\bunescape\s*\(").unwrap()),
            ],
            fallback: vec![
                (SIGNAL_EVAL, Regex::new(r"\beval\s*\(").unwrap()),
                (SIGNAL_FUNCTION_CONSTRUCTOR, Regex::new(r"\bnew\s+Function\s*\(").unwrap()),
                (
                    SIGNAL_STRING_TIMER,
                    Regex::new(r#"\bset(?:Timeout|Interval)\s*\(\s*["'`]"#).unwrap(),
                ),
                (
                    SIGNAL_DOCUMENT_WRITE,
                    Regex::new(r"\bdocument\s*\.\s*write(?:ln)?\s*\(").unwrap(),
                ),
            ],
        }
    }

    /// Inspect an inline body.
    pub fn inspect(&self, body: &str, is_module: bool) -> InlineAnalysis {
        let allocator = Allocator::default();
        let source_type = SourceType::default().with_module(is_module);
        let parser_result = Parser::new(&allocator, body, source_type).parse();

        let mut visitor = InlineVisitor::default();
        visitor.visit_program(&parser_result.program);

        let incomplete = parser_result.panicked || !parser_result.errors.is_empty();
        if incomplete {
            trace!(
                "Inline parse had {} errors, applying pattern fallback",
                parser_result.errors.len()
            );
            for (name, pattern) in &self.fallback {
                if pattern.is_match(body) {
                    visitor.signals.insert(name.to_string());
                }
            }
        }

        for (name, pattern) in &self.textual {
            if pattern.is_match(body) {
                visitor.signals.insert(name.to_string());
            }
        }

        InlineAnalysis {
            signals: visitor.signals,
            imports: visitor.imports,
        }
    }

    /// Signals only.
    pub fn detect(&self, body: &str, is_module: bool) -> BTreeSet<String> {
        self.inspect(body, is_module).signals
    }
}

impl Default for SignalDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct InlineVisitor {
    signals: BTreeSet<String>,
    imports: Vec<String>,
}

impl InlineVisitor {
    fn flag(&mut self, signal: &str) {
        self.signals.insert(signal.to_string());
    }

    fn push_import(&mut self, specifier: &str) {
        if !self.imports.iter().any(|s| s == specifier) {
            self.imports.push(specifier.to_string());
        }
    }
}

fn first_arg_is_string(arguments: &[Argument<'_>]) -> bool {
    matches!(
        arguments.first(),
        Some(Argument::StringLiteral(_)) | Some(Argument::TemplateLiteral(_))
    )
}

impl<'a> Visit<'a> for InlineVisitor {
    fn visit_call_expression(&mut self, expr: &CallExpression<'a>) {
        match &expr.callee {
            Expression::Identifier(id) => {
                if id.name == "eval" {
                    self.flag(SIGNAL_EVAL);
                } else if id.name == "Function" {
                    self.flag(SIGNAL_FUNCTION_CONSTRUCTOR);
                } else if (id.name == "setTimeout" || id.name == "setInterval")
                    && first_arg_is_string(&expr.arguments)
                {
                    self.flag(SIGNAL_STRING_TIMER);
                }
            }
            Expression::StaticMemberExpression(member) => {
                let is_document = matches!(&member.object, Expression::Identifier(id) if id.name == "document");
                if is_document && (member.property.name == "write" || member.property.name == "writeln") {
                    self.flag(SIGNAL_DOCUMENT_WRITE);
                }
                if member.property.name == "eval" {
                    self.flag(SIGNAL_EVAL);
                }
            }
            _ => {}
        }

        walk::walk_call_expression(self, expr);
    }

    fn visit_new_expression(&mut self, expr: &NewExpression<'a>) {
        if let Expression::Identifier(id) = &expr.callee {
            if id.name == "Function" {
                self.flag(SIGNAL_FUNCTION_CONSTRUCTOR);
            }
        }
        walk::walk_new_expression(self, expr);
    }

    fn visit_import_declaration(&mut self, decl: &ImportDeclaration<'a>) {
        self.push_import(decl.source.value.as_str());
        walk::walk_import_declaration(self, decl);
    }

    fn visit_import_expression(&mut self, expr: &ImportExpression<'a>) {
        if let Expression::StringLiteral(lit) = &expr.source {
            self.push_import(lit.value.as_str());
        }
        walk::walk_import_expression(self, expr);
    }
}
