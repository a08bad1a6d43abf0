//! Default configuration values

/// Default configuration file name (TOML)
pub const DEFAULT_CONFIG_TOML: &str = "gantry.toml";

/// Default configuration file name (YAML)
pub const DEFAULT_CONFIG_YAML: &str = "gantry.yaml";

/// Get list of config file names to search for
pub fn config_file_names() -> Vec<&'static str> {
    vec![
        DEFAULT_CONFIG_TOML,
        DEFAULT_CONFIG_YAML,
        ".gantry.toml",
        ".gantry.yaml",
    ]
}

/// Default configuration template
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# Gantry configuration

name = "my-app"

[signing]
enabled = true
# Each build gets its own keychain, named after the build id
# (gantry-signing-<build id>.keychain-db)
keychain = "gantry-signing.keychain-db"
team_id = "ABCDE12345"
password_env = "GANTRY_CERTIFICATE_PASSWORD"
grant_tools = ["/usr/bin/codesign", "/usr/bin/productsign"]

[[signing.bundles]]
base64_env = "APPLE_CERTIFICATE_P12"

[[signing.bundles]]
base64_env = "APPLE_INSTALLER_CERTIFICATE_P12"

[retry.local]
max_attempts = 2
initial_delay_ms = 1000
backoff_multiplier = 2.0
per_attempt_timeout_secs = 1800

[retry.network]
max_attempts = 5
initial_delay_ms = 15000
backoff_multiplier = 2.0
per_attempt_timeout_secs = 2700

# Commands may use {version}, {build_id}, {identity}, {keychain} and
# {workdir}. Other braces, like ${HOME} or awk '{print $1}', are passed
# through unchanged; write {{ and }} for a literal {version}.
[[pipeline.stages]]
name = "build"
kind = "build"
command = ["briefcase", "build", "macos", "app"]

[[pipeline.stages]]
name = "sign-app"
kind = "sign"
identity = "application"
command = ["codesign", "--force", "--deep", "--options", "runtime", "--timestamp", "--keychain", "{keychain}", "--sign", "{identity}", "dist/MyApp.app"]

[[pipeline.stages]]
name = "package"
kind = "package"
identity = "installer"
command = ["productbuild", "--component", "dist/MyApp.app", "/Applications", "--keychain", "{keychain}", "--sign", "{identity}", "dist/MyApp-{version}.pkg"]
produces = [{ path = "dist/MyApp-{version}.pkg", kind = "installer", signed = true }]

[[pipeline.stages]]
name = "notarize"
kind = "notarize"
command = ["xcrun", "notarytool", "submit", "dist/MyApp-{version}.pkg", "--keychain-profile", "notary", "--wait"]
success_pattern = "status: Accepted"

[[pipeline.stages]]
name = "staple"
kind = "staple"
command = ["xcrun", "stapler", "staple", "dist/MyApp-{version}.pkg"]
produces = [{ path = "dist/MyApp-{version}.pkg", kind = "installer" }]

[manifest]
path = "artifacts/manifest-{build_id}.json"
"#;
