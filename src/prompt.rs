//! Prompt assembly.
//!
//! A [`PromptPayload`] is built fresh for every turn from the system
//! instruction, the session history, the user's question, and the retrieved
//! context.  [`PromptPayload::messages`] lays it out in the order the model
//! sees it: instruction, prior turns, then the context-augmented question.

use crate::types::Message;

/// Default system instruction.
pub const DEFAULT_SYSTEM_INSTRUCTION: &str =
    "Answer only from the context. If information is missing, say so.";

/// Default template for the final user turn.
pub const DEFAULT_USER_TEMPLATE: &str = "Question: {question}\n\nContext:\n{context}";

const QUESTION: &str = "{question}";
const CONTEXT: &str = "{context}";

/// The fixed parts of every prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    /// Instruction sent as the system message.
    pub system_instruction: String,
    /// Template for the final user turn; `{question}` and `{context}` are substituted.
    pub user_template: String,
}

impl PromptTemplate {
    /// Creates a template with the default instruction and user turn.
    pub fn new() -> Self {
        Self {
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            user_template: DEFAULT_USER_TEMPLATE.to_string(),
        }
    }

    /// Sets the system instruction.
    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = instruction.into();
        self
    }

    /// Sets the user turn template.
    pub fn with_user_template(mut self, template: impl Into<String>) -> Self {
        self.user_template = template.into();
        self
    }

    /// Renders the final user turn.
    ///
    /// Substitution is single-pass, so placeholder text inside the question or
    /// the context is left alone.
    pub fn render_user_turn(&self, question: &str, context: &str) -> String {
        let mut out =
            String::with_capacity(self.user_template.len() + question.len() + context.len());
        let mut rest = self.user_template.as_str();
        loop {
            let next = [
                (rest.find(QUESTION), QUESTION, question),
                (rest.find(CONTEXT), CONTEXT, context),
            ]
            .into_iter()
            .filter_map(|(pos, placeholder, value)| pos.map(|pos| (pos, placeholder, value)))
            .min_by_key(|(pos, _, _)| *pos);
            match next {
                Some((pos, placeholder, value)) => {
                    out.push_str(&rest[..pos]);
                    out.push_str(value);
                    rest = &rest[pos + placeholder.len()..];
                }
                None => {
                    out.push_str(rest);
                    return out;
                }
            }
        }
    }
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the model needs to answer one turn.
///
/// A payload is immutable once built, so the rendered user turn always
/// matches its question and context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptPayload {
    system_instruction: String,
    history: Vec<Message>,
    question: String,
    context: String,
    user_turn: String,
}

impl PromptPayload {
    /// Builds a payload using the default user turn template.
    pub fn build(
        system_instruction: impl Into<String>,
        history: Vec<Message>,
        question: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        let template = PromptTemplate::new().with_system_instruction(system_instruction);
        Self::from_template(&template, history, question, context)
    }

    /// Builds a payload from `template`.
    pub fn from_template(
        template: &PromptTemplate,
        history: Vec<Message>,
        question: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        let question = question.into();
        let context = context.into();
        let user_turn = template.render_user_turn(&question, &context);
        Self {
            system_instruction: template.system_instruction.clone(),
            history,
            question,
            context,
            user_turn,
        }
    }

    /// The system instruction.
    pub fn system_instruction(&self) -> &str {
        &self.system_instruction
    }

    /// Prior turns, oldest first.
    pub fn history(&self) -> &[Message] {
        &self.history
    }

    /// The current question, as the user typed it.
    pub fn question(&self) -> &str {
        &self.question
    }

    /// Formatted retrieval context; may be empty.
    pub fn context(&self) -> &str {
        &self.context
    }

    /// The final user turn: the question augmented with the context.
    pub fn user_turn(&self) -> &str {
        &self.user_turn
    }

    /// The messages in the order they are sent to the model.
    pub fn messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        messages.push(Message::system(self.system_instruction.clone()));
        messages.extend(self.history.iter().cloned());
        messages.push(Message::user(self.user_turn.clone()));
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    #[test]
    fn message_order_is_system_history_question() {
        let history = vec![Message::user("h1"), Message::assistant("h2")];
        let payload = PromptPayload::build("sys", history, "q", "c");
        let messages = payload.messages();

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0], Message::system("sys"));
        assert_eq!(messages[1], Message::user("h1"));
        assert_eq!(messages[2], Message::assistant("h2"));
        assert_eq!(messages[3].role(), Role::User);
        assert!(messages[3].content().contains('q'));
        assert!(messages[3].content().contains('c'));
    }

    #[test]
    fn default_user_turn_layout() {
        let payload = PromptPayload::build("sys", Vec::new(), "What is X?", "• X is a widget.");
        assert_eq!(
            payload.user_turn(),
            "Question: What is X?\n\nContext:\n• X is a widget."
        );
    }

    #[test]
    fn substitution_is_single_pass() {
        let template = PromptTemplate::new().with_user_template("{context} | {question}");
        let rendered = template.render_user_turn("why {context}?", "ctx");
        assert_eq!(rendered, "ctx | why {context}?");
    }

    #[test]
    fn accessors_match_the_rendered_turn() {
        let template = PromptTemplate::new().with_user_template("{question} / {context}");
        let history = vec![Message::user("h1"), Message::assistant("h2")];
        let payload = PromptPayload::from_template(&template, history.clone(), "q", "c");
        assert_eq!(payload.system_instruction(), DEFAULT_SYSTEM_INSTRUCTION);
        assert_eq!(payload.history(), history.as_slice());
        assert_eq!(payload.question(), "q");
        assert_eq!(payload.context(), "c");
        assert_eq!(payload.user_turn(), "q / c");
        assert_eq!(payload.messages().last(), Some(&Message::user("q / c")));
    }

    #[test]
    fn build_is_deterministic() {
        let history = vec![Message::user("h1"), Message::assistant("h2")];
        let a = PromptPayload::build("sys", history.clone(), "q", "c");
        let b = PromptPayload::build("sys", history, "q", "c");
        assert_eq!(a, b);
    }
}
