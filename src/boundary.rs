//! Directory boundary filter for shell commands issued by a coding assistant.
//!
//! A guardrail, not a sandbox: rules are evaluated in order and anything the filter cannot
//! decide is allowed.
//!
//! 1. Empty command: allow.
//! 2. Hazardous pattern (deep parent traversal, recursive delete of `/`, drive-root
//!    operations): block.
//! 3. Command names an allowed root as a path and every absolute path it names is inside
//!    an allowed root: allow.
//! 4. Command starts with a known-safe program: allow.
//! 5. Command cannot be tokenized: allow.
//! 6. An absolute path outside every allowed root: block. Otherwise allow.
//!
//! Relative roots are resolved against the working directory when the config is built.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

static HAZARDS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"(?:\.\.[/\\]){4,}", "excessive parent directory traversal"),
        (
            r"\brm\s+(?:-{1,2}[A-Za-z-]+\s+)*-[A-Za-z]*[rR][A-Za-z]*\s+(?:-{1,2}[A-Za-z-]+\s+)*/(?:\*|\s|$)",
            "recursive delete from filesystem root",
        ),
        (
            r"(?i)\b(?:del|erase|rd|rmdir|format|remove-item)\b.*\b[a-z]:\\?(?:\*|\s|$)",
            "operation on a drive root",
        ),
    ]
    .into_iter()
    .map(|(pattern, reason)| (Regex::new(pattern).expect("hazard pattern compiles"), reason))
    .collect()
});

static SAFE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:cd\s+\.(?:\s|$)|(?:git|cargo|python3?|pip3?|npm|source|which|echo|mkdir|ls|wc|rm)(?:\s|$))")
        .expect("safe pattern compiles")
});

static WINDOWS_ABSOLUTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z]:[\\/]").expect("drive pattern compiles"));

#[derive(Clone, Debug)]
pub struct BoundaryConfig {
    pub root: PathBuf,
    pub extra_roots: Vec<PathBuf>,
}

impl BoundaryConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: resolve(root.into()),
            extra_roots: Vec::new(),
        }
    }

    pub fn allow(mut self, root: impl Into<PathBuf>) -> Self {
        self.extra_roots.push(resolve(root.into()));
        self
    }

    fn roots(&self) -> impl Iterator<Item = &Path> {
        std::iter::once(self.root.as_path()).chain(self.extra_roots.iter().map(PathBuf::as_path))
    }
}

/// Anchor a relative root at the working directory. A root that stays relative contains nothing.
fn resolve(root: PathBuf) -> PathBuf {
    if is_absolute(&root.to_string_lossy()) {
        return root;
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(root),
        Err(e) => {
            debug!(error = %e, root = %root.display(), "cannot resolve relative boundary root");
            root
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Block { reason: String },
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

pub fn check_command(command: &str, config: &BoundaryConfig) -> Decision {
    let command = command.trim();
    if command.is_empty() {
        return Decision::Allow;
    }
    if let Some((_, reason)) = HAZARDS.iter().find(|(re, _)| re.is_match(command)) {
        debug!(command, reason, "blocked hazardous command");
        return Decision::Block {
            reason: format!("Blocked: {}", reason),
        };
    }
    let roots: Vec<String> = config
        .roots()
        .map(|r| r.to_string_lossy().into_owned())
        .filter(|r| is_absolute(r))
        .map(|r| normalize(&r))
        .collect();
    let tokens = tokenize(command);
    if let Some(tokens) = &tokens {
        let paths: Vec<String> = absolute_paths(tokens).map(normalize).collect();
        let names_root = paths.iter().any(|p| roots.iter().any(|root| is_under(p, root)));
        if names_root && paths.iter().all(|p| roots.iter().any(|root| is_under(p, root))) {
            return Decision::Allow;
        }
    }
    if SAFE.is_match(command) {
        return Decision::Allow;
    }
    let Some(tokens) = tokens else {
        debug!(command, "unparsable command, allowing");
        return Decision::Allow;
    };

    for candidate in absolute_paths(&tokens) {
        let path = normalize(candidate);
        if !roots.iter().any(|root| is_under(&path, root)) {
            debug!(command, path = %path, "blocked path outside boundary");
            return Decision::Block {
                reason: format!(
                    "Blocked: path '{}' is outside the project boundary ({})",
                    candidate,
                    config.root.display()
                ),
            };
        }
    }
    Decision::Allow
}

/// Absolute path candidates among `tokens`, including `--flag=value` values.
fn absolute_paths(tokens: &[String]) -> impl Iterator<Item = &str> {
    tokens.iter().flat_map(|t| path_candidates(t)).filter(|c| is_absolute(c))
}

#[derive(Deserialize)]
struct HookInput {
    tool_input: ToolInput,
}

#[derive(Deserialize)]
struct ToolInput {
    #[serde(default)]
    command: Option<String>,
}

/// Decide a hook payload of the form `{"tool_input":{"command":"..."}}`. Malformed input is allowed.
pub fn check_hook_input(input: &str, config: &BoundaryConfig) -> Decision {
    match serde_json::from_str::<HookInput>(input) {
        Ok(hook) => check_command(hook.tool_input.command.as_deref().unwrap_or_default(), config),
        Err(e) => {
            debug!(error = %e, "malformed hook input, allowing");
            Decision::Allow
        }
    }
}

/// Split a command into words, honouring quotes. `None` on an unterminated quote.
pub fn tokenize(command: &str) -> Option<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = command.chars().peekable();
    while let Some(ch) = chars.next() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') if matches!(chars.peek(), Some('"') | Some('\\')) => {
                current.extend(chars.next());
            }
            (Some(_), c) => current.push(c),
            (None, '\'') | (None, '"') => quote = Some(ch),
            (None, '\\') if matches!(chars.peek(), Some('"') | Some('\'') | Some(' ')) => {
                current.extend(chars.next());
            }
            (None, c) if c.is_whitespace() || matches!(c, ';' | '|' | '&' | '<' | '>' | '(' | ')') => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            (None, c) => current.push(c),
        }
    }
    if quote.is_some() {
        return None;
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Some(tokens)
}

/// The token itself and, for `--flag=value`, the value.
fn path_candidates(token: &str) -> impl Iterator<Item = &str> {
    std::iter::once(token).chain(token.split_once('=').map(|(_, value)| value))
}

fn is_absolute(token: &str) -> bool {
    token.starts_with('/') || WINDOWS_ABSOLUTE.is_match(token)
}

/// Lexically resolve `.` and `..` with `/` separators. Windows paths are lowercased.
pub fn normalize(path: &str) -> String {
    let windows = WINDOWS_ABSOLUTE.is_match(path);
    let mut unified = path.replace('\\', "/");
    if windows {
        unified = unified.to_ascii_lowercase();
    }
    let (prefix, rest) = if windows {
        unified.split_at(2)
    } else {
        ("", unified.as_str())
    };
    let mut parts: Vec<&str> = Vec::new();
    for part in rest.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("{}/{}", prefix, parts.join("/"))
}

fn is_under(path: &str, root: &str) -> bool {
    if root.ends_with('/') {
        return path.starts_with(root);
    }
    path == root || path.strip_prefix(root).is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config() -> BoundaryConfig {
        BoundaryConfig::new("/work/project").allow("/tmp/scratch")
    }

    fn blocked(command: &str) -> bool {
        !check_command(command, &config()).is_allow()
    }

    #[test]
    fn hazardous_commands_are_blocked() {
        assert!(blocked("rm -rf /"));
        assert!(blocked("rm -r /*"));
        assert!(blocked("sudo rm -fr / --no-preserve-root"));
        assert!(blocked("cat ../../../../etc/passwd"));
        assert!(blocked(r"type ..\..\..\..\secrets.txt"));
        assert!(blocked(r"rmdir /s /q C:\"));
        assert!(blocked("format D:"));
        // Hazards win even when the command names the project root.
        assert!(blocked("rm -rf / /work/project"));
    }

    #[test]
    fn safe_programs_and_root_mentions_are_allowed() {
        assert!(!blocked(""));
        assert!(!blocked("git status"));
        assert!(!blocked("cargo test --workspace"));
        assert!(!blocked("cd ."));
        assert!(!blocked("ls /etc"));
        assert!(!blocked("cat /work/project/src/lib.rs"));
        assert!(!blocked("rm -rf ./target"));
    }

    #[test]
    fn absolute_paths_are_checked_after_normalisation() {
        assert!(blocked("cat /etc/passwd"));
        assert!(blocked("cp notes.txt /home/other/notes.txt"));
        assert!(!blocked("cat /tmp/scratch/out.log"));
        assert!(!blocked("cat /work/other/../project/notes.md"));
        assert!(blocked("tee --output=/var/log/x"));
        assert!(blocked("cat README.md>/etc/motd"));
        assert!(blocked(r"copy a.txt C:\Windows\System32\a.txt"));
        assert!(!blocked("cat ../sibling/file.txt"));
    }

    #[test]
    fn root_mentions_must_be_whole_segments() {
        assert!(blocked("cat /work/project-secrets/key.pem"));
        assert!(blocked("cat /work/projectx"));
        assert!(!blocked("cat /work/project"));
        assert!(!blocked("diff /work/project/a.txt /tmp/scratch/a.txt"));
    }

    #[test]
    fn naming_the_root_does_not_excuse_other_paths() {
        assert!(blocked("cat /etc/shadow # /work/project"));
        assert!(blocked("cp /work/project/.env /srv/share/.env"));
        assert!(blocked("tee --output=/var/log/x /work/project/out.log"));
    }

    #[test]
    fn relative_roots_resolve_against_working_directory() {
        let cwd = std::env::current_dir().unwrap();
        let config = BoundaryConfig::new(".").allow("target");
        assert_eq!(config.root, cwd.join("."));
        assert_eq!(config.extra_roots, vec![cwd.join("target")]);

        assert!(!check_command("cat /etc/shadow", &config).is_allow());
        assert!(!check_command("cat /", &config).is_allow());
        let inside = format!("cat {}/Cargo.toml", cwd.display());
        assert!(check_command(&inside, &config).is_allow());
        assert!(check_command("cat ./Cargo.toml", &config).is_allow());
    }

    #[test]
    fn static_patterns_compile() {
        assert_eq!(HAZARDS.len(), 3);
        assert!(SAFE.is_match("git status"));
        assert!(WINDOWS_ABSOLUTE.is_match(r"C:\Windows"));
    }

    #[test]
    fn windows_root_comparison_ignores_case() {
        let config = BoundaryConfig::new(r"C:\Work\Project");
        assert!(check_command(r"type c:\work\project\src\main.rs", &config).is_allow());
        assert!(!check_command(r"type C:\Users\me\secrets.txt", &config).is_allow());
    }

    #[test]
    fn unterminated_quotes_fail_open() {
        assert!(!blocked("cat '/etc/passwd"));
        assert_eq!(tokenize("cat 'a b' \"c\\\"d\""), Some(vec!["cat".into(), "a b".into(), "c\"d".into()]));
        assert_eq!(tokenize("echo \"open"), None);
    }

    #[test]
    fn normalises_lexically() {
        assert_eq!(normalize("/a/./b/../c//d"), "/a/c/d");
        assert_eq!(normalize("/../.."), "/");
        assert_eq!(normalize(r"C:\Dir\..\Other"), "c:/other");
    }

    #[test]
    fn hook_payloads() {
        let allow = check_hook_input(r#"{"tool_input":{"command":"git log"}}"#, &config());
        assert_eq!(serde_json::to_value(&allow).unwrap(), serde_json::json!({"decision": "allow"}));

        let block = check_hook_input(r#"{"tool_input":{"command":"cat /etc/shadow"}}"#, &config());
        let out = serde_json::to_value(&block).unwrap();
        assert_eq!(out["decision"], "block");
        assert!(out["reason"].as_str().unwrap().contains("/etc/shadow"));

        assert!(check_hook_input("not json", &config()).is_allow());
        assert!(check_hook_input(r#"{"tool_input":{}}"#, &config()).is_allow());
    }

    fn relative_path() -> impl Strategy<Value = String> {
        ("(\\.\\./){0,3}", "[a-z][a-z0-9_]{0,7}(/[a-z0-9_.]{1,8}){0,3}").prop_map(|(up, rest)| format!("{}{}", up, rest))
    }

    fn unsafe_program() -> impl Strategy<Value = &'static str> {
        prop_oneof![Just("cat"), Just("cp"), Just("touch"), Just("head"), Just("sed -n 1p"), Just("tee")]
    }

    proptest! {
        #[test]
        fn relative_only_commands_are_allowed(program in unsafe_program(), paths in proptest::collection::vec(relative_path(), 1..4)) {
            let command = format!("{} {}", program, paths.join(" "));
            prop_assert!(check_command(&command, &config()).is_allow(), "{}", command);
        }

        #[test]
        fn absolute_paths_outside_root_are_blocked(
            program in unsafe_program(),
            top in prop_oneof![Just("etc"), Just("usr"), Just("var"), Just("opt"), Just("home")],
            rest in "[a-z][a-z0-9_]{0,7}(/[a-z0-9_]{1,8}){0,2}",
            local in relative_path(),
        ) {
            let command = format!("{} {} /{}/{}", program, local, top, rest);
            prop_assert!(!check_command(&command, &config()).is_allow(), "{}", command);
        }
    }
}
