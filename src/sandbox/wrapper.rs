//! Turns guest source plus a handler name into one self-contained script.
//!
//! The script hands an async entry point to the bootstrap's start hook. The
//! hook resolves the invocation exactly once, whether the handler returns a
//! value, resolves a promise, throws synchronously or rejects.

use crate::function::RequestError;
use crate::function_kinds::GuestSource;

const RESERVED: &[&str] = &[
    "await", "break", "case", "catch", "class", "const", "continue", "debugger", "default",
    "delete", "do", "else", "enum", "export", "extends", "false", "finally", "for", "function",
    "if", "import", "in", "instanceof", "let", "new", "null", "return", "super", "switch", "this",
    "throw", "true", "try", "typeof", "var", "void", "while", "with", "yield",
];

/// Per-kind glue: statements run before the handler and the argument list it
/// is called with. Both see the kind's positional arguments as `__args`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Template {
    pub name: &'static str,
    pub setup: &'static str,
    pub call: &'static str,
}

impl Template {
    pub const ACTION_RUN: Template = Template {
        name: "actionRun",
        setup: "const __previousPayload = __args[0]?.properties?.resource?.payload ?? null;",
        call: "__args[0], __previousPayload",
    };

    pub const BEFORE: Template = Template {
        name: "before",
        setup: "",
        call: "__args[0]",
    };

    pub const CONFIRMATION: Template = Template {
        name: "confirmation",
        setup: "",
        call: "__args[0]",
    };

    pub const MANAGEMENT: Template = Template {
        name: "management",
        setup: "",
        call: "__args[0]",
    };

    pub const RESOLVER_FUNCTION: Template = Template {
        name: "resolverFunction",
        setup: "",
        call: "__args[0], __args[1]",
    };

    pub const SCHEMA_VARIANT_DEFINITION: Template = Template {
        name: "schemaVariantDefinition",
        setup: "",
        call: "",
    };

    pub const VALIDATION: Template = Template {
        name: "validation",
        setup: "",
        call: "__args[0]",
    };

    pub const VALIDATION_FORMAT: Template = Template {
        name: "validationFormat",
        setup: "",
        call: "__args[0], __args[1]",
    };
}

/// ASCII JavaScript identifier that is not a reserved word.
pub fn is_valid_handler(handler: &str) -> bool {
    let mut chars = handler.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    let head = first.is_ascii_alphabetic() || first == '_' || first == '$';
    head && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        && !RESERVED.contains(&handler)
}

/// Builds the script for `guest` under `template`.
///
/// The guest source is evaluated inside its own function scope, so its
/// top-level declarations never reach the global object.
pub fn wrap(guest: &GuestSource, template: Template) -> Result<String, RequestError> {
    let handler = guest.handler.as_str();
    if !is_valid_handler(handler) {
        return Err(RequestError::InvalidHandler(handler.to_string()));
    }

    let mut script = String::with_capacity(guest.code.len() + 512);
    script.push_str("(() => {\n");
    script.push_str("const __start = globalThis.__sandboxStart;\n");
    script.push_str("delete globalThis.__sandboxStart;\n");
    script.push_str("__start(async (__args) => {\n");
    if !template.setup.is_empty() {
        script.push_str(template.setup);
        script.push('\n');
    }
    script.push_str("const __handler = (() => {\n");
    script.push_str(&guest.code);
    script.push_str("\n;return typeof ");
    script.push_str(handler);
    script.push_str(" === \"function\" ? ");
    script.push_str(handler);
    script.push_str(" : undefined;\n})();\n");
    script.push_str("if (__handler === undefined) {\n");
    script.push_str("throw new ReferenceError(\"");
    script.push_str(handler);
    script.push_str(" is not defined or is not a function\");\n}\n");
    script.push_str("return await __handler(");
    script.push_str(template.call);
    script.push_str(");\n});\n})();\n");
    Ok(script)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guest(handler: &str) -> GuestSource {
        GuestSource {
            code: "function main(a) { return a; }".into(),
            handler: handler.into(),
        }
    }

    #[test]
    fn test_rejects_invalid_handler_names() {
        for bad in ["", "1main", "main()", "a.b", "return", "x; process.exit()"] {
            assert!(
                matches!(wrap(&guest(bad), Template::BEFORE), Err(RequestError::InvalidHandler(_))),
                "{bad}"
            );
        }
        assert!(wrap(&guest("$main_2"), Template::BEFORE).is_ok());
    }

    #[test]
    fn test_script_calls_handler_with_template_arguments() {
        let script = wrap(&guest("main"), Template::ACTION_RUN).unwrap();
        assert!(script.contains("const __previousPayload = __args[0]?.properties?.resource?.payload ?? null;"));
        assert!(script.contains("return await __handler(__args[0], __previousPayload);"));
        assert!(script.contains("function main(a) { return a; }"));
        assert!(script.starts_with("(() => {"));
    }

    #[test]
    fn test_schema_variant_definition_takes_no_arguments() {
        let script = wrap(&guest("main"), Template::SCHEMA_VARIANT_DEFINITION).unwrap();
        assert!(script.contains("return await __handler();"));
    }

    #[test]
    fn test_guest_source_is_terminated_before_lookup() {
        let source = GuestSource {
            code: "// trailing comment without newline".into(),
            handler: "main".into(),
        };
        let script = wrap(&source, Template::BEFORE).unwrap();
        assert!(script.contains("// trailing comment without newline\n;return typeof main"));
    }
}
