//! Prints `SessionView` changes as a running transcript.

use parley_voice::{Role, SessionView, TurnState};
use std::io::{self, Write};

/// Remembers what has already been printed so each view only adds the difference.
#[derive(Debug, Default)]
pub struct Transcript {
    printed: usize,
    conversation: u64,
    // Bytes already shown of the reply that is still streaming.
    streamed: Option<usize>,
    status: String,
    interim: String,
    error: Option<String>,
}

fn label(role: Role) -> &'static str {
    match role {
        Role::User => "you",
        Role::Assistant => "assistant",
        Role::System => "system",
    }
}

impl Transcript {
    pub fn render(&mut self, view: &SessionView, out: &mut impl Write) -> io::Result<()> {
        // Watch updates coalesce, so a reset may arrive already refilled.
        if view.conversation != self.conversation || view.messages.len() < self.printed {
            self.close_stream(out)?;
            self.printed = 0;
            self.conversation = view.conversation;
            writeln!(out, "--- new conversation ---")?;
        }
        self.show_status(view, out)?;

        let streaming = view.state == TurnState::Thinking;
        let last = view.messages.len().saturating_sub(1);
        for (i, entry) in view.messages.iter().enumerate().skip(self.printed) {
            let open = streaming && i == last && entry.role == Role::Assistant;
            match self.streamed {
                Some(shown) => {
                    write!(out, "{}", entry.content.get(shown..).unwrap_or_default())?;
                    if open {
                        self.streamed = Some(entry.content.len());
                    } else {
                        writeln!(out)?;
                        self.streamed = None;
                        self.printed = i + 1;
                    }
                }
                None if open => {
                    write!(out, "{}: {}", label(entry.role), entry.content)?;
                    self.streamed = Some(entry.content.len());
                }
                None => {
                    writeln!(out, "{}: {}", label(entry.role), entry.content)?;
                    self.printed = i + 1;
                }
            }
        }
        // A streaming reply that was discarded leaves the line open.
        if view.messages.len() <= self.printed {
            self.close_stream(out)?;
        }

        if !view.interim.is_empty() && view.interim != self.interim {
            writeln!(out, "  ... {}", view.interim)?;
        }
        self.interim = view.interim.clone();

        if view.error != self.error {
            if let Some(error) = &view.error {
                self.close_stream(out)?;
                writeln!(out, "⚠️  {}", error)?;
            }
            self.error = view.error.clone();
        }

        self.show_status(view, out)?;
        out.flush()
    }

    /// Status lines wait until a streaming reply has finished its line.
    fn show_status(&mut self, view: &SessionView, out: &mut impl Write) -> io::Result<()> {
        if view.status != self.status && self.streamed.is_none() {
            writeln!(out, "[{}]", view.status)?;
            self.status = view.status.clone();
        }
        Ok(())
    }

    fn close_stream(&mut self, out: &mut impl Write) -> io::Result<()> {
        if self.streamed.take().is_some() {
            writeln!(out)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_voice::DisplayEntry;

    fn view(state: TurnState, status: &str, messages: &[(Role, &str)]) -> SessionView {
        SessionView {
            state,
            expression: state,
            status: status.to_string(),
            error: None,
            interim: String::new(),
            messages: messages.iter().map(|(r, c)| DisplayEntry::new(*r, *c)).collect(),
            playing_audio: false,
            conversation: 0,
        }
    }

    fn render_all(views: &[SessionView]) -> String {
        let mut transcript = Transcript::default();
        let mut out = Vec::new();
        for v in views {
            transcript.render(v, &mut out).unwrap();
        }
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn streaming_reply_prints_on_one_line() {
        let text = render_all(&[
            view(TurnState::Thinking, "Thinking...", &[(Role::User, "hi"), (Role::Assistant, "")]),
            view(TurnState::Thinking, "Thinking...", &[(Role::User, "hi"), (Role::Assistant, "Hel")]),
            view(TurnState::Thinking, "Thinking...", &[(Role::User, "hi"), (Role::Assistant, "Hello")]),
            view(TurnState::Speaking, "Speaking...", &[(Role::User, "hi"), (Role::Assistant, "Hello")]),
        ]);
        assert_eq!(text, "[Thinking...]\nyou: hi\nassistant: Hello\n[Speaking...]\n");
    }

    #[test]
    fn reset_announces_new_conversation() {
        let text = render_all(&[
            view(TurnState::Idle, "ready", &[(Role::User, "hi"), (Role::Assistant, "yo")]),
            view(TurnState::Idle, "ready", &[]),
        ]);
        assert!(text.ends_with("--- new conversation ---\n"));
    }

    #[test]
    fn reset_hidden_by_coalesced_update_still_reprints() {
        let mut next = view(TurnState::Idle, "ready", &[(Role::User, "again"), (Role::Assistant, "sure")]);
        next.conversation = 1;
        let text = render_all(&[
            view(TurnState::Idle, "ready", &[(Role::User, "hi"), (Role::Assistant, "yo")]),
            next,
        ]);
        assert_eq!(
            text,
            "[ready]\nyou: hi\nassistant: yo\n--- new conversation ---\nyou: again\nassistant: sure\n"
        );
    }

    #[test]
    fn discarded_reply_closes_the_line() {
        let text = render_all(&[
            view(TurnState::Thinking, "Thinking...", &[(Role::User, "hi"), (Role::Assistant, "par")]),
            view(TurnState::Idle, "Error", &[(Role::User, "hi")]),
        ]);
        assert_eq!(text, "[Thinking...]\nyou: hi\nassistant: par\n[Error]\n");
    }
}
