use crate::launch::classpath::classpath_separator;
use crate::launch::LaunchContext;
use crate::loader::version::{
    current_os_name, Argument, ArgumentValue, Rule, RuleAction, VersionJson,
};
use dunce::canonicalize;
use std::collections::HashMap;
use std::path::Path;

const LAUNCHER_BRAND: &str = "Kiln";

/// Build the JVM half of the argv: memory, GC defaults, user extras, then
/// the version document's own jvm arguments with placeholders substituted.
pub fn build_jvm_arguments(
    ctx: &LaunchContext,
    version: &VersionJson,
    natives_dir: &Path,
    classpath: &str,
) -> Vec<String> {
    let mut args = Vec::new();

    args.push(format!("-Xmx{}m", ctx.max_ram_mb));
    args.extend(default_gc_args());
    args.extend(ctx.extra_jvm_args.iter().cloned());

    let variables = jvm_variables(ctx, natives_dir, classpath);
    let mut manifest_args = Vec::new();
    if let Some(arguments) = &version.arguments {
        for arg in &arguments.jvm {
            // jvm args are substituted but never split: values like
            // "-DFabricMcEmu= net.minecraft.client.main.Main " are one token
            manifest_args.extend(process_argument(arg, &variables, ctx, false));
        }
    }

    let has_natives = manifest_args
        .iter()
        .any(|a| a.starts_with("-Djava.library.path="));
    if !has_natives {
        let natives = canonical_string(natives_dir);
        args.push(format!("-Djava.library.path={}", natives));
    }
    if !manifest_args
        .iter()
        .any(|a| a.starts_with("-Dminecraft.launcher.brand="))
    {
        args.push(format!("-Dminecraft.launcher.brand={}", LAUNCHER_BRAND));
    }
    if !manifest_args
        .iter()
        .any(|a| a.starts_with("-Dminecraft.launcher.version="))
    {
        args.push(format!(
            "-Dminecraft.launcher.version={}",
            env!("CARGO_PKG_VERSION")
        ));
    }

    args.extend(manifest_args);

    // legacy documents have no jvm arguments at all; supply the classpath
    let has_classpath = args.iter().any(|a| a == "-cp" || a == "-classpath");
    if !has_classpath && version.arguments.is_none() {
        args.push("-cp".to_string());
        args.push(classpath.to_string());
    }

    args
}

/// Build the game-argument half from the modern `arguments.game` list or the
/// legacy `minecraftArguments` string.
pub fn build_game_arguments(ctx: &LaunchContext, version: &VersionJson) -> Vec<String> {
    let variables = game_variables(ctx, version);
    let mut args = Vec::new();

    if let Some(arguments) = &version.arguments {
        for arg in &arguments.game {
            args.extend(process_argument(arg, &variables, ctx, true));
        }
    } else if let Some(legacy) = &version.minecraft_arguments {
        for token in legacy.split_whitespace() {
            let substituted = substitute_variables(token, &variables);
            if !substituted.trim().is_empty() {
                args.push(substituted);
            }
        }
    }

    args
}

fn process_argument(
    arg: &Argument,
    variables: &HashMap<String, String>,
    ctx: &LaunchContext,
    split: bool,
) -> Vec<String> {
    let expand = |value: &str| -> Vec<String> {
        if contains_empty_placeholder(value, variables) {
            // dropping the whole token avoids orphan flags like a lone
            // --quickPlayPath
            return Vec::new();
        }
        let substituted = substitute_variables(value, variables);
        if split {
            split_preserving_quotes(&substituted)
        } else if substituted.trim().is_empty() {
            Vec::new()
        } else {
            vec![substituted]
        }
    };

    match arg {
        Argument::Simple(s) => expand(s),
        Argument::Conditional { rules, value } => {
            if !evaluate_rules(rules, ctx) {
                return Vec::new();
            }
            match value {
                ArgumentValue::Single(s) => expand(s),
                ArgumentValue::Multiple(values) => {
                    let mut out = Vec::new();
                    for value in values {
                        let tokens = expand(value);
                        if tokens.is_empty() && contains_empty_placeholder(value, variables) {
                            // one empty member invalidates the whole group
                            return Vec::new();
                        }
                        out.extend(tokens);
                    }
                    out
                }
            }
        }
    }
}

/// Launch-time rule evaluation, including the feature checks the library
/// selector ignores.
fn evaluate_rules(rules: &[Rule], ctx: &LaunchContext) -> bool {
    let os_name = current_os_name();
    let mut allowed = false;

    for rule in rules {
        let mut applies = true;

        if let Some(os) = &rule.os {
            if let Some(name) = &os.name {
                if name != os_name {
                    applies = false;
                }
            }
            if applies {
                if let Some(arch) = &os.arch {
                    if arch != std::env::consts::ARCH {
                        applies = false;
                    }
                }
            }
            if applies {
                if let Some(version_expr) = &os.version {
                    applies = match regex::Regex::new(version_expr) {
                        Ok(re) => {
                            let host = sysinfo::System::long_os_version().unwrap_or_default();
                            re.is_match(&host)
                        }
                        Err(_) => false,
                    };
                }
            }
        }

        if applies {
            if let Some(features) = &rule.features {
                for (feature, wanted) in features {
                    let actual = match feature.as_str() {
                        "is_demo_user" => ctx.credentials.access_token == "0",
                        "has_custom_resolution" => ctx.window.is_some(),
                        _ => false,
                    };
                    if actual != *wanted {
                        applies = false;
                        break;
                    }
                }
            }
        }

        if applies {
            allowed = rule.action == RuleAction::Allow;
        }
    }

    allowed
}

pub fn substitute_variables(text: &str, variables: &HashMap<String, String>) -> String {
    let mut result = text.to_string();
    for (key, value) in variables {
        result = result.replace(&format!("${{{}}}", key), value);
    }
    result
}

/// True when the text references a placeholder that is absent or empty.
fn contains_empty_placeholder(text: &str, variables: &HashMap<String, String>) -> bool {
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return true;
        };
        match variables.get(&after[..end]) {
            Some(value) if !value.trim().is_empty() => {}
            _ => return true,
        }
        rest = &after[end + 1..];
    }
    false
}

/// Whitespace tokenization that respects single and double quotes; quotes
/// are stripped from the produced tokens.
pub(crate) fn split_preserving_quotes(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut buf = String::new();
    let mut in_double = false;
    let mut in_single = false;

    for c in s.chars() {
        match c {
            '"' if !in_single => in_double = !in_double,
            '\'' if !in_double => in_single = !in_single,
            c if c.is_whitespace() && !in_double && !in_single => {
                if !buf.is_empty() {
                    out.push(std::mem::take(&mut buf));
                }
            }
            c => buf.push(c),
        }
    }
    if !buf.is_empty() {
        out.push(buf);
    }
    out
}

fn jvm_variables(
    ctx: &LaunchContext,
    natives_dir: &Path,
    classpath: &str,
) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    vars.insert(
        "natives_directory".to_string(),
        canonical_string(natives_dir),
    );
    vars.insert("launcher_name".to_string(), LAUNCHER_BRAND.to_string());
    vars.insert(
        "launcher_version".to_string(),
        env!("CARGO_PKG_VERSION").to_string(),
    );
    vars.insert("classpath".to_string(), classpath.to_string());
    vars.insert(
        "library_directory".to_string(),
        canonical_string(&ctx.config.libraries_dir()),
    );
    vars.insert(
        "classpath_separator".to_string(),
        classpath_separator().to_string(),
    );
    vars.insert("version_name".to_string(), ctx.runtime.installed_id.clone());
    vars
}

fn game_variables(ctx: &LaunchContext, version: &VersionJson) -> HashMap<String, String> {
    let mut vars = HashMap::new();

    vars.insert(
        "auth_player_name".to_string(),
        ctx.credentials.username.clone(),
    );
    vars.insert("auth_uuid".to_string(), ctx.credentials.uuid.clone());
    vars.insert(
        "auth_access_token".to_string(),
        ctx.credentials.access_token.clone(),
    );
    vars.insert(
        "auth_session".to_string(),
        ctx.credentials.access_token.clone(),
    );
    vars.insert("clientid".to_string(), ctx.credentials.client_token.clone());
    vars.insert("user_type".to_string(), ctx.credentials.user_type.clone());
    vars.insert("user_properties".to_string(), "{}".to_string());

    vars.insert("version_name".to_string(), version.id.clone());
    vars.insert(
        "version_type".to_string(),
        version
            .version_type
            .clone()
            .unwrap_or_else(|| "release".to_string()),
    );

    vars.insert("game_directory".to_string(), canonical_string(&ctx.game_dir));
    let assets_dir = ctx.config.assets_dir();
    let assets = canonical_string(&assets_dir);
    vars.insert("assets_root".to_string(), assets.clone());
    vars.insert("game_assets".to_string(), assets);
    if let Some(asset_index) = &version.asset_index {
        vars.insert("assets_index_name".to_string(), asset_index.id.clone());
    } else if let Some(assets_id) = &version.assets {
        vars.insert("assets_index_name".to_string(), assets_id.clone());
    }

    if let Some((width, height)) = ctx.window {
        vars.insert("resolution_width".to_string(), width.to_string());
        vars.insert("resolution_height".to_string(), height.to_string());
    }

    vars
}

fn canonical_string(path: &Path) -> String {
    canonicalize(path)
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|_| path.to_string_lossy().to_string())
}

fn default_gc_args() -> Vec<String> {
    [
        "-XX:+UseG1GC",
        "-XX:+UnlockExperimentalVMOptions",
        "-XX:G1NewSizePercent=20",
        "-XX:G1ReservePercent=20",
        "-XX:MaxGCPauseMillis=50",
        "-XX:G1HeapRegionSize=32M",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
