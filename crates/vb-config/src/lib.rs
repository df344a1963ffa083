//! # vb-config — the line-oriented configuration reader
//!
//! Grounded on the original daemon's `conf.c`: comments, repeatable
//! `KEY VALUE` lines, `KEY { ... }` nested blocks, `include PATH` with
//! glob expansion, and `$VAR`/`${VAR}`/`$(VAR)` expansion against
//! previously-defined keys falling back to the process environment.
//!
//! Two deliberate departures from the original, both favoring the
//! simpler, more predictable behavior over a literal C port:
//! - Repeated plain keys accumulate into one ordered `Vec<String>` in
//!   first-to-last file order, rather than the original's LIFO linked
//!   list (`get_str_value`/`get_int_value` read the *last* value, which
//!   reproduces "later line wins" without the reversed iteration order
//!   showing up anywhere else).
//! - A file is parsed at most once per [`ConfTree`] tree, full stop —
//!   not just guarded against re-entering its own direct includer. This
//!   also catches diamond-shaped `include` graphs the original's
//!   single-parent check would re-read.

use glob::glob;
use log::debug;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use vb_core::{Result, VbError};

const MAX_EXPANSION_DEPTH: u32 = 16;

/// One value slot under a key: either the accumulated scalars from
/// repeated `KEY VALUE` lines, or a nested block.
#[derive(Debug, Clone)]
pub enum ConfValue {
    Entry(Vec<String>),
    Block(ConfTree),
}

/// A parsed configuration scope: the root file, or the body of one
/// `KEY { ... }` block. Backed by an insertion-ordered `Vec` rather than
/// a hash map — matches the original's small, rarely-queried table, and
/// keeps file order recoverable for `keys()`.
#[derive(Debug, Clone, Default)]
pub struct ConfTree {
    items: Vec<(String, ConfValue)>,
}

impl ConfTree {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    fn push_value(&mut self, key: &str, value: String) {
        for (k, v) in self.items.iter_mut() {
            if k == key {
                if let ConfValue::Entry(values) = v {
                    values.push(value);
                    return;
                }
            }
        }
        self.items.push((key.to_string(), ConfValue::Entry(vec![value])));
    }

    fn push_block(&mut self, key: &str, block: ConfTree) {
        self.items.push((key.to_string(), ConfValue::Block(block)));
    }

    /// All scalar values recorded under `key`, in first-to-last file
    /// order, across every plain-entry appearance.
    pub fn get_values(&self, key: &str) -> Vec<&str> {
        self.items
            .iter()
            .filter_map(|(k, v)| match v {
                ConfValue::Entry(values) if k == key => Some(values.iter().map(String::as_str)),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// The last recorded value for `key` — "the latest line wins",
    /// matching the original's observable override behavior.
    pub fn get_str_value(&self, key: &str) -> Option<&str> {
        self.get_values(key).into_iter().last()
    }

    pub fn get_int_value(&self, key: &str, default: i64) -> i64 {
        match self.get_str_value(key) {
            Some(v) => str_to_int(v, default),
            None => default,
        }
    }

    pub fn get_bool_value(&self, key: &str, default: bool) -> bool {
        match self.get_str_value(key) {
            Some(v) => as_bool(v, default),
            None => default,
        }
    }

    /// Every block recorded under `key`, in file order.
    pub fn get_blocks(&self, key: &str) -> Vec<&ConfTree> {
        self.items
            .iter()
            .filter_map(|(k, v)| match v {
                ConfValue::Block(b) if k == key => Some(b),
                _ => None,
            })
            .collect()
    }

    /// The last block recorded under `key`.
    pub fn get_block(&self, key: &str) -> Option<&ConfTree> {
        self.get_blocks(key).into_iter().last()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|(k, _)| k.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Case-insensitive boolean word table: `on/off`, `yes/no`, `true/false`,
/// `enable[d]/disable[d]`. Returns `None` when `raw` matches none of
/// them, leaving the caller's default in force.
pub fn coerce_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "on" | "yes" | "true" | "enable" | "enabled" => Some(true),
        "off" | "no" | "false" | "disable" | "disabled" => Some(false),
        _ => None,
    }
}

/// An all-digit (optionally signed) value parses as its integer
/// truthiness; otherwise falls through to the word table, then `default`.
pub fn as_bool(raw: &str, default: bool) -> bool {
    let trimmed = raw.trim();
    if let Ok(n) = trimmed.parse::<i64>() {
        return n != 0;
    }
    coerce_bool(trimmed).unwrap_or(default)
}

fn str_to_int(raw: &str, default: i64) -> i64 {
    let trimmed = raw.trim();
    if let Ok(n) = trimmed.parse::<i64>() {
        return n;
    }
    match coerce_bool(trimmed) {
        Some(true) => 1,
        Some(false) => 0,
        None => default,
    }
}

/// Loads `path` as a root configuration file, expanding `include`
/// directives and variable references along the way.
pub fn load(path: impl AsRef<Path>) -> Result<ConfTree> {
    let mut parser = Parser {
        entered: HashSet::new(),
    };
    let mut tree = ConfTree::new();
    parser.parse_into(path.as_ref(), &mut tree)?;
    Ok(tree)
}

struct Parser {
    entered: HashSet<PathBuf>,
}

impl Parser {
    fn parse_into(&mut self, path: &Path, tree: &mut ConfTree) -> Result<()> {
        let canonical = path
            .canonicalize()
            .map_err(|e| VbError::Config(format!("{}: {e}", path.display())))?;
        if !self.entered.insert(canonical) {
            return Ok(());
        }

        let content = fs::read_to_string(path)
            .map_err(|e| VbError::Config(format!("{}: {e}", path.display())))?;
        debug!("config: parsed {}", path.display());
        let mut lines = content.lines();
        self.parse_block(&mut lines, tree, path, false)
    }

    fn parse_block<'a, I>(
        &mut self,
        lines: &mut I,
        tree: &mut ConfTree,
        cur_file: &Path,
        in_block: bool,
    ) -> Result<()>
    where
        I: Iterator<Item = &'a str>,
    {
        for raw in lines.by_ref() {
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if trimmed == "}" {
                if in_block {
                    return Ok(());
                }
                return Err(VbError::Config(format!(
                    "{}: unmatched closing brace",
                    cur_file.display()
                )));
            }

            let mut fields = trimmed.splitn(2, char::is_whitespace);
            let key = fields.next().unwrap_or("");
            let rest = fields.next().unwrap_or("").trim_start();
            if rest.is_empty() {
                continue;
            }

            if key == "include" {
                let pattern = expand(tree, rest)?;
                self.expand_include(&pattern, cur_file, tree)?;
                continue;
            }

            if rest == "{" {
                let mut block = ConfTree::new();
                self.parse_block(lines, &mut block, cur_file, true)?;
                tree.push_block(key, block);
            } else {
                let value = expand(tree, rest)?;
                tree.push_value(key, value);
            }
        }

        if in_block {
            return Err(VbError::Config(format!(
                "{}: unterminated block",
                cur_file.display()
            )));
        }
        Ok(())
    }

    fn expand_include(&mut self, pattern: &str, cur_file: &Path, tree: &mut ConfTree) -> Result<()> {
        let resolved = resolve_pattern(cur_file, pattern);
        let paths = glob(&resolved)
            .map_err(|e| VbError::Config(format!("invalid include pattern '{pattern}': {e}")))?;

        let mut matched_any = false;
        for entry in paths {
            let candidate = entry
                .map_err(|e| VbError::Config(format!("include '{pattern}': {e}")))?;
            if candidate.is_dir() {
                continue;
            }
            matched_any = true;
            self.parse_into(&candidate, tree)?;
        }

        if !matched_any {
            return Err(VbError::Config(format!(
                "include '{pattern}' matched no files"
            )));
        }
        Ok(())
    }
}

fn resolve_pattern(cur_file: &Path, pattern: &str) -> String {
    let as_path = Path::new(pattern);
    if as_path.is_absolute() {
        pattern.to_string()
    } else {
        let dir = cur_file.parent().unwrap_or_else(|| Path::new("."));
        dir.join(pattern).to_string_lossy().into_owned()
    }
}

/// Expands `$VAR`, `${VAR}`, and `$(VAR)` references in `value`,
/// checking `tree`'s own already-parsed keys before the process
/// environment, recursively, bounded to [`MAX_EXPANSION_DEPTH`] so a
/// cyclic reference is a config error rather than a hang.
fn expand(tree: &ConfTree, value: &str) -> Result<String> {
    expand_depth(tree, value, 0)
}

fn expand_depth(tree: &ConfTree, value: &str, depth: u32) -> Result<String> {
    let Some(dollar_pos) = value.find('$') else {
        return Ok(value.to_string());
    };
    if depth >= MAX_EXPANSION_DEPTH {
        return Err(VbError::Config(format!(
            "variable expansion in '{value}' exceeded {MAX_EXPANSION_DEPTH} levels"
        )));
    }

    let bytes = value.as_bytes();
    let prefix = &value[..dollar_pos];
    let mut i = dollar_pos + 1;
    let closing = match bytes.get(i) {
        Some(b'{') => {
            i += 1;
            Some(b'}')
        }
        Some(b'(') => {
            i += 1;
            Some(b')')
        }
        _ => None,
    };

    let name_start = i;
    while i < bytes.len() {
        let b = bytes[i];
        let stop = match closing {
            Some(close) => b == close,
            None => b == b' ' || b == b'\t',
        };
        if stop {
            break;
        }
        i += 1;
    }
    let name = &value[name_start..i];
    if closing.is_some() && i < bytes.len() {
        i += 1;
    }

    let substituted = tree
        .get_str_value(name)
        .map(str::to_string)
        .or_else(|| std::env::var(name).ok())
        .unwrap_or_default();

    let combined = format!("{prefix}{substituted}{}", &value[i..]);
    expand_depth(tree, &combined, depth + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(name: &str, contents: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "vb-config-test-{}-{}-{name}",
            std::process::id(),
            name.len()
        ));
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn parses_repeated_keys_in_file_order() {
        let path = write_temp("repeated.conf", "listen 8080\nlisten 8081\n");
        let tree = load(&path).unwrap();
        assert_eq!(tree.get_values("listen"), vec!["8080", "8081"]);
        assert_eq!(tree.get_str_value("listen"), Some("8081"));
        fs::remove_file(path).ok();
    }

    #[test]
    fn parses_nested_block() {
        let path = write_temp(
            "block.conf",
            "worker {\n    count 4\n    name alpha\n}\n",
        );
        let tree = load(&path).unwrap();
        let block = tree.get_block("worker").unwrap();
        assert_eq!(block.get_int_value("count", 0), 4);
        assert_eq!(block.get_str_value("name"), Some("alpha"));
        fs::remove_file(path).ok();
    }

    #[test]
    fn skips_comments_and_blank_lines() {
        let path = write_temp("comment.conf", "# a comment\n\nport 9999\n");
        let tree = load(&path).unwrap();
        assert_eq!(tree.get_int_value("port", 0), 9999);
        fs::remove_file(path).ok();
    }

    #[test]
    fn expands_env_var_fallback() {
        std::env::set_var("VB_CONFIG_TEST_VAR", "fromenv");
        let path = write_temp("envvar.conf", "greeting hello-${VB_CONFIG_TEST_VAR}\n");
        let tree = load(&path).unwrap();
        assert_eq!(tree.get_str_value("greeting"), Some("hello-fromenv"));
        fs::remove_file(path).ok();
        std::env::remove_var("VB_CONFIG_TEST_VAR");
    }

    #[test]
    fn expands_reference_to_earlier_key_before_env() {
        let path = write_temp("selfref.conf", "base /var/run\npid_file ${base}/verben.pid\n");
        let tree = load(&path).unwrap();
        assert_eq!(tree.get_str_value("pid_file"), Some("/var/run/verben.pid"));
        fs::remove_file(path).ok();
    }

    #[test]
    fn self_referential_env_var_hits_the_expansion_bound() {
        std::env::set_var("VB_CONFIG_CYCLE", "$VB_CONFIG_CYCLE");
        let path = write_temp("cyclic.conf", "a $VB_CONFIG_CYCLE\n");
        let err = load(&path).unwrap_err();
        assert!(matches!(err, VbError::Config(_)));
        fs::remove_file(path).ok();
        std::env::remove_var("VB_CONFIG_CYCLE");
    }

    #[test]
    fn as_bool_covers_word_table_and_digits() {
        assert!(as_bool("on", false));
        assert!(as_bool("Yes", false));
        assert!(as_bool("1", false));
        assert!(!as_bool("off", true));
        assert!(!as_bool("0", true));
        assert_eq!(as_bool("garbage", true), true);
    }

    #[test]
    fn unterminated_block_is_an_error() {
        let path = write_temp("unterminated.conf", "worker {\n    count 1\n");
        let err = load(&path).unwrap_err();
        assert!(matches!(err, VbError::Config(_)));
        fs::remove_file(path).ok();
    }
}
