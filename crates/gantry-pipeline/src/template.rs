//! Placeholder expansion for stage commands
//!
//! Stage commands, environment values and produced paths may refer to
//! `{version}`, `{build_id}`, `{identity}`, `{keychain}` and `{workdir}`.
//! Only a lowercase name in braces is a placeholder; other braced text such
//! as `${HOME}` or `awk '{print $1}'` is kept as written. `{{` and `}}`
//! stand for literal braces.

use std::path::PathBuf;

/// Values available to placeholders
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    pub version: String,
    pub build_id: String,
    /// Tool reference of the stage's resolved identity
    pub identity: Option<String>,
    /// Session store name
    pub keychain: Option<String>,
    pub workdir: PathBuf,
}

impl TemplateContext {
    /// Expand every placeholder in `input`.
    ///
    /// Unknown placeholders and values the stage does not have are errors,
    /// never left in place.
    pub fn expand(&self, input: &str) -> Result<String, String> {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;

        while let Some(pos) = rest.find(|c: char| c == '{' || c == '}') {
            out.push_str(&rest[..pos]);
            let tail = &rest[pos..];

            if tail.starts_with("{{") || tail.starts_with("}}") {
                out.push_str(&tail[..1]);
                rest = &tail[2..];
                continue;
            }
            if tail.starts_with('}') {
                out.push('}');
                rest = &tail[1..];
                continue;
            }

            let body = &tail[1..];
            let len = body
                .find(|c: char| !(c.is_ascii_lowercase() || c == '_'))
                .unwrap_or(body.len());
            let name = &body[..len];
            match body[len..].chars().next() {
                Some('}') if !name.is_empty() => {
                    out.push_str(&self.lookup(name)?);
                    rest = &body[len + 1..];
                }
                None if !name.is_empty() => {
                    return Err(format!("unterminated placeholder in '{}'", input));
                }
                _ => {
                    out.push('{');
                    rest = body;
                }
            }
        }

        out.push_str(rest);
        Ok(out)
    }

    fn lookup(&self, name: &str) -> Result<String, String> {
        match name {
            "version" => Ok(self.version.clone()),
            "build_id" => Ok(self.build_id.clone()),
            "workdir" => Ok(self.workdir.display().to_string()),
            "identity" => self
                .identity
                .clone()
                .ok_or_else(|| "{identity} used but the stage resolves no identity".to_string()),
            "keychain" => self
                .keychain
                .clone()
                .ok_or_else(|| "{keychain} used but no signing session is active".to_string()),
            other => Err(format!("unknown placeholder {{{}}}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TemplateContext {
        TemplateContext {
            version: "1.4.0".to_string(),
            build_id: "b-42".to_string(),
            identity: Some("Developer ID Installer: X (ABC123)".to_string()),
            keychain: None,
            workdir: PathBuf::from("/work"),
        }
    }

    #[test]
    fn test_expands_placeholders() {
        assert_eq!(
            ctx().expand("dist/R2MIDI-{version}-{build_id}.pkg").unwrap(),
            "dist/R2MIDI-1.4.0-b-42.pkg"
        );
        assert_eq!(
            ctx().expand("--sign={identity}").unwrap(),
            "--sign=Developer ID Installer: X (ABC123)"
        );
        assert_eq!(ctx().expand("{workdir}/out").unwrap(), "/work/out");
        assert_eq!(ctx().expand("plain").unwrap(), "plain");
    }

    #[test]
    fn test_literal_braces() {
        assert_eq!(ctx().expand("{{\"a\": 1}}").unwrap(), "{\"a\": 1}");
    }

    #[test]
    fn test_shell_braces_pass_through() {
        assert_eq!(
            ctx().expand("awk '{print $1}' dist/{version}.txt").unwrap(),
            "awk '{print $1}' dist/1.4.0.txt"
        );
        assert_eq!(ctx().expand("${HOME}/Library").unwrap(), "${HOME}/Library");
        assert_eq!(ctx().expand("find . -exec rm {} +").unwrap(), "find . -exec rm {} +");
        assert_eq!(ctx().expand("{\"a\": 1}").unwrap(), "{\"a\": 1}");
    }

    #[test]
    fn test_errors() {
        assert!(ctx().expand("{keychain}").unwrap_err().contains("no signing session"));
        assert!(ctx().expand("{nope}").unwrap_err().contains("unknown placeholder {nope}"));
        assert!(ctx().expand("{version").unwrap_err().contains("unterminated"));
    }
}
