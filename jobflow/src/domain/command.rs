//! Work descriptors understood by the execution backends.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::ExecutionKind;
use crate::{Error, Result};

const HTTP_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

/// What a job runs. The engine only dispatches on the tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Command {
    Shell(ShellCommand),
    Function(FunctionCall),
    Http(HttpRequest),
}

/// A command line handed to the platform shell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellCommand {
    pub script: String,
    /// Values substituted for `{name}` placeholders in `script`.
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Extra environment variables for the child process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// A call to a function registered with the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

/// Request body of an HTTP job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpBody {
    Json(Value),
    Text(String),
}

/// An outbound HTTP request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<HttpBody>,
}

impl HttpRequest {
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    pub fn with_json(mut self, body: Value) -> Self {
        self.body = Some(HttpBody::Json(body));
        self
    }

    pub fn with_text(mut self, body: impl Into<String>) -> Self {
        self.body = Some(HttpBody::Text(body.into()));
        self
    }
}

impl Command {
    pub fn shell(script: impl Into<String>) -> Self {
        Self::Shell(ShellCommand {
            script: script.into(),
            parameters: Map::new(),
            env: BTreeMap::new(),
        })
    }

    pub fn function(name: impl Into<String>, parameters: Map<String, Value>) -> Self {
        Self::Function(FunctionCall {
            name: name.into(),
            parameters,
        })
    }

    pub fn http(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self::Http(HttpRequest {
            method: method.into().to_ascii_uppercase(),
            url: url.into(),
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            body: None,
        })
    }

    pub fn kind(&self) -> ExecutionKind {
        match self {
            Self::Shell(_) => ExecutionKind::Shell,
            Self::Function(_) => ExecutionKind::Function,
            Self::Http(_) => ExecutionKind::Http,
        }
    }

    /// Reject descriptors no backend could run.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Shell(shell) => {
                if shell.script.trim().is_empty() {
                    return Err(Error::invalid_argument("shell command must not be empty"));
                }
            }
            Self::Function(call) => {
                if call.name.trim().is_empty() {
                    return Err(Error::invalid_argument("function name must not be empty"));
                }
            }
            Self::Http(request) => {
                let method = request.method.to_ascii_uppercase();
                if !HTTP_METHODS.contains(&method.as_str()) {
                    return Err(Error::invalid_argument(format!(
                        "unsupported HTTP method '{}'",
                        request.method
                    )));
                }
                let url = reqwest::Url::parse(&request.url).map_err(|e| {
                    Error::invalid_argument(format!("invalid URL '{}': {}", request.url, e))
                })?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(Error::invalid_argument(format!(
                        "unsupported URL scheme '{}'",
                        url.scheme()
                    )));
                }
            }
        }
        Ok(())
    }
}

impl ShellCommand {
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    /// The script with every `{name}` placeholder replaced by its parameter.
    /// Strings are inserted verbatim, other values as JSON.
    pub fn rendered(&self) -> String {
        self.parameters
            .iter()
            .fold(self.script.clone(), |script, (name, value)| {
                let replacement = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                script.replace(&format!("{{{}}}", name), &replacement)
            })
    }
}

impl From<ShellCommand> for Command {
    fn from(value: ShellCommand) -> Self {
        Self::Shell(value)
    }
}

impl From<HttpRequest> for Command {
    fn from(value: HttpRequest) -> Self {
        Self::Http(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_rejects_malformed() {
        assert!(Command::shell("   ").validate().is_err());
        assert!(Command::function("", Map::new()).validate().is_err());
        assert!(Command::http("GET", "not a url").validate().is_err());
        assert!(Command::http("BREW", "http://localhost/").validate().is_err());
        assert!(Command::http("GET", "ftp://localhost/").validate().is_err());

        assert!(Command::shell("true").validate().is_ok());
        assert!(Command::http("post", "https://example.com/hook").validate().is_ok());
    }

    #[test]
    fn test_rendered_substitutes_parameters() {
        let shell = ShellCommand {
            script: "echo {greeting} {count}".to_string(),
            parameters: Map::new(),
            env: BTreeMap::new(),
        }
        .with_parameter("greeting", "hello")
        .with_parameter("count", 3);
        assert_eq!(shell.rendered(), "echo hello 3");
    }

    #[test]
    fn test_tagged_serialization() {
        let command = Command::http("get", "http://localhost/health").into_json();
        assert_eq!(command["type"], "http");
        assert_eq!(command["method"], "GET");

        let back: Command = serde_json::from_value(json!({"type": "shell", "script": "true"})).unwrap();
        assert_eq!(back, Command::shell("true"));
    }

    impl Command {
        fn into_json(self) -> Value {
            serde_json::to_value(self).unwrap()
        }
    }
}
