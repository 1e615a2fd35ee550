//! Environment file parsing.
//!
//! Reads a dotenv-style file into an ordered list of `KEY=VALUE` strings.
//! Values may be single- or double-quoted, backslash escapes are honored, and
//! unquoted `#` starts a comment.

/// Parses the contents of an environment file.
///
/// Lines without `=`, comment lines, and keys containing `#` are skipped. An
/// `export ` prefix on the key is removed.
pub fn parse_env_file(input: &str) -> Vec<String> {
    let mut env = Vec::new();
    for raw in input.lines() {
        let line = raw.trim();
        if line.starts_with('#') {
            continue;
        }
        let Some((key, rest)) = line.split_once('=') else {
            continue;
        };
        if key.contains('#') {
            continue;
        }
        let mut key = key;
        if key.to_lowercase().starts_with("export ") {
            key = &key["export ".len()..];
        }

        let mut value = String::new();
        let mut escaped = false;
        let mut in_single = false;
        let mut in_double = false;
        for c in rest.chars() {
            if c == '#' && !in_single && !in_double {
                break;
            }
            if c == '\\' && !escaped {
                escaped = true;
                continue;
            }
            if c == '\'' && !in_double && !escaped {
                in_single = !in_single;
                continue;
            }
            if c == '"' && !in_single && !escaped {
                in_double = !in_double;
                continue;
            }
            escaped = false;
            value.push(c);
        }
        env.push(format!("{}={}", key.trim(), value.trim()));
    }
    env
}
