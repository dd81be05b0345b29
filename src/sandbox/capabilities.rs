//! The capability set handed to one isolate.
//!
//! A [`CapabilitySet`] is built from the function kind alone and never
//! changes afterwards. The bootstrap script turns it into guest globals; the
//! ops consult the same struct (through the isolate's op state) before
//! touching request storage or builders, so a capability the bootstrap did
//! not install cannot be reached through the ops either.

use serde::Serialize;

use crate::builders::BUILDER_NAMES;
use crate::function::{FunctionKind, StorageAccess};

const CORE_JS: &str = include_str!("js/core.js");
const LODASH_JS: &str = include_str!("js/lodash.js");
const JOI_JS: &str = include_str!("js/joi.js");
const BUILDERS_JS: &str = include_str!("js/builders.js");

// `ops` is captured by the bootstrap closure; nothing else may reach the
// runtime internals (`__bootstrap.core.print` writes straight to stdout).
const LOCKDOWN_JS: &str = r#"
delete globalThis.__bootstrap;
delete globalThis.Deno;
delete globalThis.eval;
for (const name of ["__bootstrap", "Deno", "eval"]) {
  if (name in globalThis) throw new Error(`${name} is still reachable from guest code`);
}
const AsyncFunction = (async function () {}).constructor;
const GeneratorFunction = (function* () {}).constructor;
for (const proto of [Function.prototype, AsyncFunction.prototype, GeneratorFunction.prototype]) {
  Object.defineProperty(proto, "constructor", { value: undefined, configurable: false, writable: false });
}
"#;

/// Globals installed for every kind.
const BASE_GLOBALS: &[&str] = &[
    "console",
    "setTimeout",
    "clearTimeout",
    "YAML",
    "TOML",
    "jsonpatch",
    "zlib",
    "base64",
    "btoa",
    "atob",
    "requestStorage",
    "_",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitySet {
    pub kind: FunctionKind,
    pub storage_write: bool,
    pub joi: bool,
    pub builders: Vec<&'static str>,
}

impl CapabilitySet {
    pub fn for_kind(kind: FunctionKind) -> Self {
        let (storage_write, joi, builders) = match kind {
            FunctionKind::ActionRun
            | FunctionKind::Before
            | FunctionKind::Confirmation
            | FunctionKind::Management
            | FunctionKind::ResolverFunction => (true, false, Vec::new()),
            FunctionKind::SchemaVariantDefinition => (false, true, BUILDER_NAMES.to_vec()),
            FunctionKind::Validation => (false, true, Vec::new()),
        };
        Self {
            kind,
            storage_write,
            joi,
            builders,
        }
    }

    pub fn storage_access(&self) -> StorageAccess {
        if self.storage_write {
            StorageAccess::ReadWrite
        } else {
            StorageAccess::ReadOnly
        }
    }

    pub fn allows_builder(&self, name: &str) -> bool {
        self.builders.contains(&name)
    }

    /// Every global name guest code of this kind can see.
    pub fn globals(&self) -> Vec<&'static str> {
        let mut globals = BASE_GLOBALS.to_vec();
        if self.joi {
            globals.push("Joi");
        }
        globals.extend(self.builders.iter().copied());
        globals
    }

    /// Script that installs this set and then locks the global scope down.
    /// Runs once per isolate, before any guest code.
    pub fn bootstrap_script(&self) -> String {
        let caps = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());

        let mut script = String::with_capacity(16 * 1024);
        script.push_str("((ops, caps) => {\n");
        script.push_str(CORE_JS);
        script.push_str("{\n");
        script.push_str(LODASH_JS);
        script.push_str("}\n");
        if self.joi {
            script.push_str("{\n");
            script.push_str(JOI_JS);
            script.push_str("}\n");
        }
        if !self.builders.is_empty() {
            script.push_str("{\n");
            script.push_str(BUILDERS_JS);
            script.push_str("}\n");
        }
        script.push_str(LOCKDOWN_JS);
        script.push_str("})(Deno.core.ops, ");
        script.push_str(&caps);
        script.push_str(");\n");
        script
    }
}
