//! Tool configuration (the `tools:` section of the app config).

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

pub const DEFAULT_LOCATION: &str = "Happy Valley, Oregon, United States";

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsConfig {
    /// Whether tool documentation is offered to the model at all.
    #[serde(default)]
    pub enabled: bool,
    /// Answer for `get_current_location`.
    #[serde(default = "default_location")]
    pub location: String,
    /// Registers `execute_shell_command`.
    #[serde(default)]
    pub allow_shell: bool,
    #[serde(default)]
    pub cli: Vec<CliToolConfig>,
    #[serde(default)]
    pub rest: Vec<RestToolConfig>,
    #[serde(default)]
    pub image: Vec<ImageToolConfig>,
}

fn default_location() -> String {
    DEFAULT_LOCATION.to_string()
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            location: default_location(),
            allow_shell: false,
            cli: Vec::new(),
            rest: Vec::new(),
            image: Vec::new(),
        }
    }
}

impl ToolsConfig {
    /// Every configured tool name, built-ins included, in registration order.
    pub fn declared_names(&self) -> Vec<&str> {
        let mut names = vec![
            "get_current_datetime",
            "get_current_location",
            "simple_osint_search",
        ];
        if self.allow_shell {
            names.push("execute_shell_command");
        }
        names.extend(self.cli.iter().map(|c| c.name.as_str()));
        names.extend(self.rest.iter().map(|r| r.name.as_str()));
        names.extend(self.image.iter().map(|i| i.name.as_str()));
        names
    }
}

/// Wraps an external program. `{arg}` in `args` is replaced by the caller's
/// argument after splitting on whitespace, so no shell is involved.
#[derive(Debug, Clone, Deserialize)]
pub struct CliToolConfig {
    pub name: String,
    pub description: String,
    pub program: String,
    /// Argument template, e.g. `"-A {arg}"`.
    #[serde(default = "default_cli_args")]
    pub args: String,
    #[serde(default = "default_cli_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
}

fn default_cli_args() -> String {
    "{arg}".to_string()
}
fn default_cli_timeout_secs() -> u64 {
    120
}
fn default_max_output_chars() -> usize {
    4000
}

/// A GET lookup against a JSON API.
#[derive(Debug, Clone, Deserialize)]
pub struct RestToolConfig {
    pub name: String,
    pub description: String,
    /// Base URL. The argument is appended as a path segment unless
    /// `query_param` is set.
    pub url: String,
    #[serde(default)]
    pub query_param: Option<String>,
    /// Header values may reference `${ENV_VARS}`.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_rest_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_rest_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageMethod {
    /// Search: the argument goes in the query string.
    #[default]
    Get,
    /// Generation: the argument is filled into `body`.
    Post,
}

/// An image generator or image search against a JSON API.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageToolConfig {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub method: ImageMethod,
    pub url: String,
    /// Query parameter carrying the argument on GET.
    #[serde(default = "default_image_query_param")]
    pub query_param: String,
    /// Fixed query parameters. Values may reference `${ENV_VARS}`.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// JSON body for POST; `{arg}` in any string is replaced.
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    /// Header values may reference `${ENV_VARS}`.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// JSON pointer to the answer, e.g. `/data/0/url`.
    pub result_pointer: String,
    /// Where base64 image results are written.
    #[serde(default)]
    pub save_dir: Option<PathBuf>,
    #[serde(default = "default_image_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_image_query_param() -> String {
    "q".to_string()
}
fn default_image_timeout_secs() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let yaml = r#"
            name: nmap_scan
            description: Scan a host.
            program: nmap
        "#;
        let cfg: CliToolConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.args, "{arg}");
        assert_eq!(cfg.timeout_secs, 120);
        assert_eq!(cfg.max_output_chars, 4000);
    }

    #[test]
    fn test_declared_names() {
        let yaml = r#"
            allow_shell: true
            rest:
              - name: ipinfo_lookup
                description: IP info.
                url: https://ipinfo.io
        "#;
        let cfg: ToolsConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.location, DEFAULT_LOCATION);
        assert_eq!(cfg.rest[0].timeout_secs, 10);
        let names = cfg.declared_names();
        assert!(names.contains(&"execute_shell_command"));
        assert_eq!(names.last(), Some(&"ipinfo_lookup"));
    }

    #[test]
    fn test_image_defaults_and_names() {
        let yaml = r#"
            image:
              - name: duckduckgo_images
                description: First image for the keywords.
                url: https://images.example/search
                result_pointer: /results/0/image
              - name: stable_diffusion
                description: Generate an image.
                method: post
                url: https://api.example/v1/images/generations
                body: { prompt: "{arg}" }
                result_pointer: /data/0/url
        "#;
        let cfg: ToolsConfig = serde_yaml::from_str(yaml).unwrap();
        let search = &cfg.image[0];
        assert_eq!(search.method, ImageMethod::Get);
        assert_eq!(search.query_param, "q");
        assert_eq!(search.timeout_secs, 60);
        assert!(search.save_dir.is_none());
        assert_eq!(cfg.image[1].method, ImageMethod::Post);
        assert_eq!(cfg.declared_names().last(), Some(&"stable_diffusion"));
    }
}
