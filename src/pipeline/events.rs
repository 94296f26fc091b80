use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::feed::SessionState;
use crate::graph::GraphPayload;
use crate::layout::LayoutFrame;

/// One line of the renderer stream.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum RendererEvent {
    Status {
        status: SessionState,
    },
    #[serde(rename_all = "camelCase")]
    Graph {
        request_id: u64,
        graph: GraphPayload,
        layout: LayoutFrame,
    },
    Error {
        message: String,
    },
}

impl RendererEvent {
    pub fn error(message: impl fmt::Display) -> Self {
        Self::Error {
            message: message.to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineCommand {
    Start,
    Stop,
    Reconnect,
    Clear,
    Quit,
}

#[derive(Debug, PartialEq, Eq)]
pub struct UnknownCommand(pub String);

impl fmt::Display for UnknownCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown command `{}`", self.0)
    }
}

impl FromStr for PipelineCommand {
    type Err = UnknownCommand;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        match line.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "reconnect" => Ok(Self::Reconnect),
            "clear" => Ok(Self::Clear),
            "quit" | "exit" => Ok(Self::Quit),
            _ => Err(UnknownCommand(line.trim().to_owned())),
        }
    }
}
