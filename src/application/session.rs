use crate::application::binder;
use crate::application::invoker::{CapabilityInvoker, InvokeError};
use crate::application::mediator::Mediator;
use crate::domain::types::CapabilityKind;
use crate::infrastructure::model::ModelProvider;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

const RESOURCE_USAGE: &str = "usage: @resource <name> [key=value ...]";
const PROMPT_USAGE: &str = "usage: /prompt <name> [key=value ...]";

/// What one input line produced: text for the user, or the quit signal.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Reply(String),
    Quit,
}

/// Routes one line of user input to the registry, the invoker, or the
/// mediation loop. Lookup and binding errors are reported and the session
/// keeps going; only `quit` ends it.
pub struct Session<P: ModelProvider> {
    invoker: Arc<CapabilityInvoker>,
    mediator: Mediator<P>,
}

impl<P: ModelProvider> Session<P> {
    pub fn new(invoker: Arc<CapabilityInvoker>, mediator: Mediator<P>) -> Self {
        Self { invoker, mediator }
    }

    pub fn banner() -> String {
        [
            "Chatbot started. Commands:",
            "  quit                            - exit the chatbot",
            "  @resources                      - list available resources",
            "  @resource <name> [key=value]    - fetch a resource",
            "  /prompts                        - list available prompts",
            "  /prompt <name> [key=value]      - run a prompt through the model",
            "  anything else                   - ask the model directly",
        ]
        .join("\n")
    }

    pub async fn handle(&self, line: &str) -> Outcome {
        let line = line.trim();
        if line.is_empty() {
            return Outcome::Reply(String::new());
        }
        debug!(line, "Dispatching session input");

        if line.eq_ignore_ascii_case("quit") {
            info!("Session quit requested");
            return Outcome::Quit;
        }
        if line == "@resources" {
            return Outcome::Reply(self.list(CapabilityKind::Resource));
        }
        if let Some(rest) = line.strip_prefix('@') {
            return Outcome::Reply(self.direct_resource(rest).await);
        }
        if line == "/prompts" {
            return Outcome::Reply(self.list(CapabilityKind::Prompt));
        }
        if let Some(rest) = line.strip_prefix('/') {
            return Outcome::Reply(self.run_prompt(rest).await);
        }

        Outcome::Reply(self.query(line.to_string()).await)
    }

    fn list(&self, kind: CapabilityKind) -> String {
        let descriptors = self.invoker.registry().list(kind);
        if descriptors.is_empty() {
            return format!("No {kind}s available.");
        }
        let mut lines = vec![format!("Available {kind}s:")];
        for descriptor in descriptors {
            lines.push(format!("- {}: {}", descriptor.name, descriptor.description));
        }
        lines.join("\n")
    }

    /// `@resource <name> [args...]`: lookup, bind, fetch, print.
    async fn direct_resource(&self, rest: &str) -> String {
        let Some((name, tokens)) = parse_command(rest, "resource") else {
            return RESOURCE_USAGE.to_string();
        };
        match self.bind_and_invoke(CapabilityKind::Resource, &name, &tokens).await {
            Ok(payload) => render_payload(&payload),
            Err(message) => message,
        }
    }

    /// `/prompt <name> [args...]`: render server-side, then feed the
    /// rendered text through the mediation loop as if the user typed it.
    async fn run_prompt(&self, rest: &str) -> String {
        let Some((name, tokens)) = parse_command(rest, "prompt") else {
            return PROMPT_USAGE.to_string();
        };
        let rendered = match self.bind_and_invoke(CapabilityKind::Prompt, &name, &tokens).await {
            Ok(payload) => match payload {
                Value::String(text) => text,
                other => other.to_string(),
            },
            Err(message) => return message,
        };
        self.query(rendered).await
    }

    async fn bind_and_invoke(
        &self,
        kind: CapabilityKind,
        name: &str,
        tokens: &[String],
    ) -> Result<Value, String> {
        let descriptor = self
            .invoker
            .registry()
            .lookup(kind, name)
            .ok_or_else(|| {
                InvokeError::NotFound {
                    kind,
                    name: name.to_string(),
                }
                .user_message()
            })?;
        let arguments = binder::bind_tokens(descriptor, tokens).map_err(|error| error.to_string())?;
        self.invoker
            .invoke(kind, name, &arguments)
            .await
            .map_err(|error| error.user_message())
    }

    async fn query(&self, text: String) -> String {
        match self.mediator.resolve(text).await {
            Ok(answer) => answer,
            Err(error) => error.user_message(),
        }
    }
}

/// Splits `<name> [tokens...]` out of a command tail; `keyword` is the
/// expected command word (`resource` or `prompt`).
fn parse_command(rest: &str, keyword: &str) -> Option<(String, Vec<String>)> {
    let mut parts = rest.split_whitespace();
    if parts.next()? != keyword {
        return None;
    }
    let name = parts.next()?.to_string();
    Some((name, parts.map(String::from).collect()))
}

fn render_payload(payload: &Value) -> String {
    match payload {
        Value::String(text) => text.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::backend::{BackendError, CapabilityBackend};
    use crate::application::mediator::MediatorOptions;
    use crate::application::registry::CapabilityRegistry;
    use crate::infrastructure::model::{CompletionRequest, ModelError};
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Mutex;

    #[derive(Clone)]
    struct ScriptedModel {
        replies: Arc<Mutex<Vec<String>>>,
        requests: Arc<Mutex<Vec<CompletionRequest>>>,
    }

    impl ScriptedModel {
        fn new(replies: Vec<&str>) -> Self {
            Self {
                replies: Arc::new(Mutex::new(replies.into_iter().map(String::from).collect())),
                requests: Arc::new(Mutex::new(Vec::new())),
            }
        }

        async fn requests(&self) -> Vec<CompletionRequest> {
            self.requests.lock().await.clone()
        }
    }

    #[async_trait]
    impl ModelProvider for ScriptedModel {
        async fn complete(&self, request: CompletionRequest) -> Result<String, ModelError> {
            self.requests.lock().await.push(request);
            let mut replies = self.replies.lock().await;
            Ok(if replies.is_empty() {
                "fallback answer".to_string()
            } else {
                replies.remove(0)
            })
        }
    }

    struct DemoBackend;

    #[async_trait]
    impl CapabilityBackend for DemoBackend {
        async fn list_resources(&self) -> Result<Vec<Value>, BackendError> {
            Ok(vec![
                json!({
                    "uri": "api://test",
                    "name": "api_test",
                    "description": "Call the test endpoint of our Flask API"
                }),
                json!({
                    "uri": "api://get_data",
                    "name": "api_get_data",
                    "description": "Call the get data endpoint of our Flask API"
                }),
            ])
        }

        async fn list_prompts(&self) -> Result<Vec<Value>, BackendError> {
            Ok(vec![json!({
                "name": "summarize",
                "description": "Summarize a topic",
                "arguments": [{"name": "topic", "required": true}]
            })])
        }

        async fn list_tools(&self) -> Result<Vec<Value>, BackendError> {
            Ok(vec![json!({
                "name": "execute_gpt4all",
                "description": "Generate a response using the local model",
                "inputSchema": {
                    "properties": {"prompt": {"type": "string"}},
                    "required": ["prompt"]
                }
            })])
        }

        async fn read_resource(&self, uri: &str) -> Result<Value, BackendError> {
            let text = if uri == "api://get_data" {
                json!({"A": "Data 1", "B": "Data 2", "C": "Data 3"}).to_string()
            } else {
                json!({"message": "API is working!"}).to_string()
            };
            Ok(json!({"contents": [{"uri": uri, "text": text}]}))
        }

        async fn render_prompt(&self, name: &str, arguments: Value) -> Result<Value, BackendError> {
            let topic = arguments
                .get("topic")
                .and_then(Value::as_str)
                .unwrap_or_default();
            Ok(json!({"messages": [{
                "role": "user",
                "content": {"type": "text", "text": format!("{name}: write about {topic}")}
            }]}))
        }

        async fn call_tool(&self, _name: &str, _arguments: Value) -> Result<Value, BackendError> {
            Ok(json!({"content": [{"type": "text", "text": "tool output"}], "isError": false}))
        }
    }

    /// Same catalog as `DemoBackend`, but the server connection drops as
    /// soon as a tool is called.
    struct DroppedToolBackend;

    #[async_trait]
    impl CapabilityBackend for DroppedToolBackend {
        async fn list_resources(&self) -> Result<Vec<Value>, BackendError> {
            DemoBackend.list_resources().await
        }

        async fn list_prompts(&self) -> Result<Vec<Value>, BackendError> {
            DemoBackend.list_prompts().await
        }

        async fn list_tools(&self) -> Result<Vec<Value>, BackendError> {
            DemoBackend.list_tools().await
        }

        async fn read_resource(&self, uri: &str) -> Result<Value, BackendError> {
            DemoBackend.read_resource(uri).await
        }

        async fn render_prompt(&self, name: &str, arguments: Value) -> Result<Value, BackendError> {
            DemoBackend.render_prompt(name, arguments).await
        }

        async fn call_tool(&self, _name: &str, _arguments: Value) -> Result<Value, BackendError> {
            Err(BackendError::Terminated)
        }
    }

    async fn session(model: ScriptedModel) -> Session<ScriptedModel> {
        session_with(model, Arc::new(DemoBackend)).await
    }

    async fn session_with(
        model: ScriptedModel,
        backend: Arc<dyn CapabilityBackend>,
    ) -> Session<ScriptedModel> {
        let registry = Arc::new(
            CapabilityRegistry::discover(backend.as_ref())
                .await
                .expect("discovery succeeds"),
        );
        let invoker = Arc::new(CapabilityInvoker::new(backend, registry));
        let mediator = Mediator::new(
            model,
            invoker.clone(),
            MediatorOptions {
                model: "llama3".into(),
                system_prompt: None,
                max_rounds: 4,
            },
        );
        Session::new(invoker, mediator)
    }

    fn reply(outcome: Outcome) -> String {
        match outcome {
            Outcome::Reply(text) => text,
            Outcome::Quit => panic!("unexpected quit"),
        }
    }

    #[tokio::test]
    async fn quit_ends_the_session() {
        let session = session(ScriptedModel::new(Vec::new())).await;
        assert_eq!(session.handle("quit").await, Outcome::Quit);
        assert_eq!(session.handle("  QUIT  ").await, Outcome::Quit);
    }

    #[tokio::test]
    async fn lists_both_demo_resources() {
        let session = session(ScriptedModel::new(Vec::new())).await;
        let text = reply(session.handle("@resources").await);
        assert!(text.contains("api_test"));
        assert!(text.contains("api_get_data"));
    }

    #[tokio::test]
    async fn fetches_a_resource_and_prints_its_payload() {
        let session = session(ScriptedModel::new(Vec::new())).await;
        let text = reply(session.handle("@resource api_get_data").await);
        assert!(text.contains("\"A\": \"Data 1\""));
        assert!(text.contains("\"B\": \"Data 2\""));
        assert!(text.contains("\"C\": \"Data 3\""));
    }

    #[tokio::test]
    async fn unknown_resource_reports_without_ending_the_session() {
        let session = session(ScriptedModel::new(Vec::new())).await;
        let text = reply(session.handle("@resource api_missing").await);
        assert!(text.contains("api_missing"));
        assert!(text.contains("No resource"));

        // The session still services the next command.
        let text = reply(session.handle("@resources").await);
        assert!(text.contains("api_test"));
    }

    #[tokio::test]
    async fn rejects_unknown_arguments_on_a_no_arg_resource() {
        let session = session(ScriptedModel::new(Vec::new())).await;
        let text = reply(session.handle("@resource api_test verbose=1").await);
        assert!(text.contains("unknown argument 'verbose'"));
    }

    #[tokio::test]
    async fn bad_resource_command_prints_usage() {
        let session = session(ScriptedModel::new(Vec::new())).await;
        assert_eq!(reply(session.handle("@resource").await), RESOURCE_USAGE);
        assert_eq!(reply(session.handle("@fetch api_test").await), RESOURCE_USAGE);
    }

    #[tokio::test]
    async fn lists_prompts() {
        let session = session(ScriptedModel::new(Vec::new())).await;
        let text = reply(session.handle("/prompts").await);
        assert!(text.contains("summarize"));
    }

    #[tokio::test]
    async fn prompt_run_feeds_rendered_text_into_the_loop() {
        let model = ScriptedModel::new(vec!["A fine summary."]);
        let session = session(model.clone()).await;

        let text = reply(session.handle("/prompt summarize topic=rust").await);
        assert_eq!(text, "A fine summary.");

        let requests = model.requests().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].turns[0].content, "summarize: write about rust");
    }

    #[tokio::test]
    async fn prompt_missing_required_argument_is_reported() {
        let model = ScriptedModel::new(Vec::new());
        let session = session(model.clone()).await;

        let text = reply(session.handle("/prompt summarize").await);
        assert!(text.contains("missing required argument 'topic'"));
        // The loop never ran.
        assert!(model.requests().await.is_empty());
    }

    #[tokio::test]
    async fn free_text_goes_to_the_mediation_loop() {
        let model = ScriptedModel::new(vec!["Direct answer."]);
        let session = session(model.clone()).await;

        let text = reply(session.handle("what is rust?").await);
        assert_eq!(text, "Direct answer.");

        let requests = model.requests().await;
        assert_eq!(requests[0].turns[0].content, "what is rust?");
    }

    #[tokio::test]
    async fn transport_failure_fails_the_query_but_not_the_session() {
        let model = ScriptedModel::new(vec![
            r#"{"action":"call_tool","tool":"execute_gpt4all","arguments":{"prompt":"hi"}}"#,
        ]);
        let session = session_with(model, Arc::new(DroppedToolBackend)).await;

        let text = reply(session.handle("ask the tool something").await);
        assert!(text.contains("Lost the connection to the capability server"));

        // The catalog is already in memory, so the next command still works.
        let text = reply(session.handle("@resources").await);
        assert!(text.contains("api_test"));
        assert!(text.contains("api_get_data"));
    }

    #[tokio::test]
    async fn blank_input_is_a_no_op() {
        let session = session(ScriptedModel::new(Vec::new())).await;
        assert_eq!(reply(session.handle("   ").await), "");
    }
}
