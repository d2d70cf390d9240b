use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{Conversation, ModelId, ToolCall, ToolDefinition};

/// Everything one streaming call needs besides the provider selection.
#[derive(Debug, Clone)]
pub struct StreamRequest<'a> {
    pub conversation: &'a Conversation,
    pub model: ModelId,
    pub tools: &'a [ToolDefinition],
    pub system_prompt: Option<String>,
    pub cancellation: CancellationToken,
}

impl<'a> StreamRequest<'a> {
    pub fn new(conversation: &'a Conversation, model: impl Into<ModelId>) -> Self {
        Self {
            conversation,
            model: model.into(),
            tools: &[],
            system_prompt: None,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_tools(mut self, tools: &'a [ToolDefinition]) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }
}

/// Terminal result of a successful stream.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Completion {
    pub finish_reason: Option<String>,
    /// `None` when the model made no tool calls, never an empty list.
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl Completion {
    pub fn new(finish_reason: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            finish_reason: finish_reason.filter(|reason| !reason.is_empty()),
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        }
    }
}

/// Receiver of a stream's output.
///
/// `on_chunk` may be called any number of times with non-empty text. Exactly
/// one of `on_complete` or `on_error` is called afterwards, once.
pub trait StreamSink: Send {
    fn on_chunk(&mut self, text: &str);

    fn on_complete(&mut self, finish_reason: Option<String>, tool_calls: Option<Vec<ToolCall>>);

    fn on_error(&mut self, message: String);
}

/// A [`StreamSink`] assembled from three closures.
pub struct CallbackSink<C, D, E> {
    on_chunk: C,
    on_complete: D,
    on_error: E,
}

impl<C, D, E> CallbackSink<C, D, E>
where
    C: FnMut(&str) + Send,
    D: FnMut(Option<String>, Option<Vec<ToolCall>>) + Send,
    E: FnMut(String) + Send,
{
    pub fn new(on_chunk: C, on_complete: D, on_error: E) -> Self {
        Self {
            on_chunk,
            on_complete,
            on_error,
        }
    }
}

impl<C, D, E> StreamSink for CallbackSink<C, D, E>
where
    C: FnMut(&str) + Send,
    D: FnMut(Option<String>, Option<Vec<ToolCall>>) + Send,
    E: FnMut(String) + Send,
{
    fn on_chunk(&mut self, text: &str) {
        (self.on_chunk)(text);
    }

    fn on_complete(&mut self, finish_reason: Option<String>, tool_calls: Option<Vec<ToolCall>>) {
        (self.on_complete)(finish_reason, tool_calls);
    }

    fn on_error(&mut self, message: String) {
        (self.on_error)(message);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Chunk(String),
    Complete {
        finish_reason: Option<String>,
        tool_calls: Option<Vec<ToolCall>>,
    },
    Error(String),
}

/// Forwards stream output into an unbounded channel. Sends to a closed
/// receiver are ignored.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<StreamEvent>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::UnboundedSender<StreamEvent>) -> Self {
        Self { sender }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(sender), receiver)
    }
}

impl StreamSink for ChannelSink {
    fn on_chunk(&mut self, text: &str) {
        let _ = self.sender.send(StreamEvent::Chunk(text.to_owned()));
    }

    fn on_complete(&mut self, finish_reason: Option<String>, tool_calls: Option<Vec<ToolCall>>) {
        let _ = self.sender.send(StreamEvent::Complete {
            finish_reason,
            tool_calls,
        });
    }

    fn on_error(&mut self, message: String) {
        let _ = self.sender.send(StreamEvent::Error(message));
    }
}
