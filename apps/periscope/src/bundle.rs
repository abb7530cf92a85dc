use std::sync::OnceLock;

/// External screenshot dependency, loaded ahead of the inline bundle.
/// html2canvas-pro rather than html2canvas because it understands the modern
/// CSS color functions (lab, oklch, oklab, lch) current browsers emit.
const HTML2CANVAS_TAG: &str = r#"<script src="https://cdn.jsdelivr.net/npm/html2canvas-pro@1.5.8/dist/html2canvas-pro.min.js" integrity="sha384-QbVSYhU9faw2C7l92rI0Dmke8Yod6KaOixC1kkbO/dGnMDKtbWhwcxSSOkmHXWom" crossorigin="anonymous"></script>"#;

struct ScriptModule {
    name: &'static str,
    source: &'static str,
}

/// Instrumentation modules in load order. Leaves first: any module referenced
/// by another must appear earlier. `api.js` assembles the public surface and
/// must stay last.
const MODULES: &[ScriptModule] = &[
    ScriptModule { name: "session", source: include_str!("scripts/session.js") },
    ScriptModule { name: "core", source: include_str!("scripts/core.js") },
    ScriptModule { name: "utils", source: include_str!("scripts/utils.js") },
    ScriptModule { name: "errors", source: include_str!("scripts/errors.js") },
    ScriptModule { name: "performance", source: include_str!("scripts/performance.js") },
    ScriptModule { name: "interaction", source: include_str!("scripts/interaction.js") },
    ScriptModule { name: "mutation", source: include_str!("scripts/mutation.js") },
    ScriptModule { name: "capture", source: include_str!("scripts/capture.js") },
    ScriptModule { name: "execute", source: include_str!("scripts/execute.js") },
    ScriptModule { name: "api", source: include_str!("scripts/api.js") },
];

/// The HTML snippet the injector inserts into proxied pages: one external
/// `<script src>` tag plus one inline `<script>` holding every module inside
/// a single IIFE. Assembled once per process.
pub fn snippet() -> &'static str {
    static SNIPPET: OnceLock<String> = OnceLock::new();
    SNIPPET.get_or_init(build_snippet)
}

pub fn module_names() -> Vec<&'static str> {
    MODULES.iter().map(|module| module.name).collect()
}

fn build_snippet() -> String {
    let mut out = String::new();
    out.push_str(HTML2CANVAS_TAG);
    out.push('\n');
    out.push_str("<script>\n(function() {\n'use strict';\n\n");
    for module in MODULES {
        out.push_str("// ");
        out.push_str(module.name);
        out.push_str(" module\n");
        out.push_str(&strip_module(module.source));
        out.push_str("\n\n");
    }
    out.push_str("})();\n</script>\n");
    out
}

/// Removes a module's outer IIFE wrapper and its own `use strict` directive;
/// both are provided once by the combined wrapper.
fn strip_module(js: &str) -> String {
    let js = js.trim();
    let Some(inner) = strip_iife(js) else {
        return js.to_string();
    };
    inner
        .replacen("'use strict';", "", 1)
        .replacen("\"use strict\";", "", 1)
        .trim()
        .to_string()
}

fn strip_iife(js: &str) -> Option<&str> {
    if !js.starts_with("(function()") {
        return None;
    }
    let mut depth = 0usize;
    let mut start = None;
    for (i, b) in js.bytes().enumerate() {
        match b {
            b'{' => {
                if start.is_none() {
                    start = Some(i + 1);
                }
                depth += 1;
            }
            b'}' => {
                if depth == 0 {
                    return None;
                }
                depth -= 1;
                if depth == 0 {
                    return Some(&js[start?..i]);
                }
            }
            _ => {}
        }
    }
    None
}
