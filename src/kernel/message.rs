use std::collections::BTreeMap;

use serde::Deserialize;

/// One typed message read from a kernel's output stream.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct KernelMessage {
    /// Correlation id of the submission that produced this message. Kernel
    /// lifecycle messages carry none.
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(flatten)]
    pub content: MessageContent,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "msg_type", rename_all = "snake_case")]
pub enum MessageContent {
    Stream {
        name: String,
        text: String,
    },
    Error {
        #[serde(default)]
        ename: String,
        #[serde(default)]
        evalue: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
    ExecuteResult {
        #[serde(default)]
        data: BTreeMap<String, serde_json::Value>,
    },
    Status {
        execution_state: ExecutionState,
    },
    /// Any message kind this service does not act on.
    #[serde(other)]
    Unrecognized,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum ExecutionState {
    Starting,
    Busy,
    Idle,
    Other(String),
}

impl From<String> for ExecutionState {
    fn from(value: String) -> Self {
        match value.as_str() {
            "starting" => Self::Starting,
            "busy" => Self::Busy,
            "idle" => Self::Idle,
            _ => Self::Other(value),
        }
    }
}

impl KernelMessage {
    pub fn is_child_of(&self, msg_id: &str) -> bool {
        self.parent_id.as_deref() == Some(msg_id)
    }

    pub fn is_idle(&self) -> bool {
        matches!(
            self.content,
            MessageContent::Status {
                execution_state: ExecutionState::Idle
            }
        )
    }
}

/// The `text/plain` rendering of an execution result, empty when the kernel
/// supplied none.
pub fn plain_text(data: &BTreeMap<String, serde_json::Value>) -> &str {
    data.get("text/plain")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("")
}

#[cfg(test)]
impl KernelMessage {
    pub fn stream(parent: &str, name: &str, text: &str) -> Self {
        Self {
            parent_id: Some(parent.to_string()),
            content: MessageContent::Stream {
                name: name.to_string(),
                text: text.to_string(),
            },
        }
    }

    pub fn error(parent: &str, traceback: &[&str]) -> Self {
        Self {
            parent_id: Some(parent.to_string()),
            content: MessageContent::Error {
                ename: "Error".to_string(),
                evalue: String::new(),
                traceback: traceback.iter().map(|l| l.to_string()).collect(),
            },
        }
    }

    pub fn result(parent: &str, text: &str) -> Self {
        let mut data = BTreeMap::new();
        data.insert("text/plain".to_string(), serde_json::Value::from(text));
        Self {
            parent_id: Some(parent.to_string()),
            content: MessageContent::ExecuteResult { data },
        }
    }

    pub fn status(parent: Option<&str>, state: ExecutionState) -> Self {
        Self {
            parent_id: parent.map(ToString::to_string),
            content: MessageContent::Status {
                execution_state: state,
            },
        }
    }
}
