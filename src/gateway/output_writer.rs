//! Serializes the concurrent "voices" of an agent turn (default narration, hidden thought,
//! named detail panels) into one well-bracketed token stream.
//!
//! Grounded on `core/output_writer.py::OutputWriter`: a current-section state machine that emits
//! opening/closing markers on transition, plus a bounded queue transport with a flush sentinel.

use tokio::sync::mpsc::Sender;

/// Which "voice" is currently open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Section {
    Default,
    Thought,
    Detail(String),
}

/// Serializes writes from one agent turn into a single ordered stream, either pushed onto a
/// bounded channel (the HTTP/SSE path) or written to stdout (the direct-mode CLI path).
pub struct OutputWriter {
    section: Section,
    queue: Option<Sender<String>>,
    output_buffer: String,
}

impl OutputWriter {
    /// Stream to an async channel; the server pushes an empty-string sentinel after `clear()` so
    /// the consuming SSE loop knows the turn finished.
    pub fn with_queue(queue: Sender<String>) -> Self {
        OutputWriter {
            section: Section::Default,
            queue: Some(queue),
            output_buffer: String::new(),
        }
    }

    /// No transport: every write lands on stdout, for the direct/CLI mode.
    pub fn stdout() -> Self {
        OutputWriter {
            section: Section::Default,
            queue: None,
            output_buffer: String::new(),
        }
    }

    pub fn output_buffer(&self) -> &str {
        &self.output_buffer
    }

    async fn emit(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.output_buffer.push_str(text);
        match &self.queue {
            Some(tx) => {
                let _ = tx.send(text.to_string()).await;
            }
            None => {
                use std::io::Write;
                print!("{}", text);
                let _ = std::io::stdout().flush();
            }
        }
    }

    /// Write to the `default` narration voice.
    pub async fn default(&mut self, text: &str) {
        self.write(text, Section::Default, false, false).await;
    }

    /// Write to the hidden `<think>` voice.
    pub async fn thought(&mut self, text: &str) {
        self.write(text, Section::Thought, false, false).await;
    }

    /// Write to a named `<details>` panel.
    pub async fn detail(&mut self, topic: &str, text: &str) {
        self.write(text, Section::Detail(topic.to_string()), false, false)
            .await;
    }

    /// The general write path every convenience method funnels through.
    ///
    /// `separate`, with no section transition, prefixes a blank-line separator so consecutive
    /// writes to the same voice stay visually distinct. `clean` strips literal `<think>`/`</think>`
    /// substrings out of the payload before it's emitted, for voices that must never themselves
    /// contain a thought marker.
    pub async fn write(&mut self, text: &str, section: Section, separate: bool, clean: bool) {
        let mut out = String::new();
        let changed = self.section != section;

        if changed {
            out.push_str(&self.close_marker());
            out.push_str(&self.open_marker(&section));
        } else if separate {
            out.push_str("\n\n");
        }

        let payload = if clean {
            text.replace("<think>", "").replace("</think>", "")
        } else {
            text.to_string()
        };

        out.push_str(&payload);
        self.section = section;
        self.emit(&out).await;
    }

    fn open_marker(&self, section: &Section) -> String {
        match section {
            Section::Default => String::new(),
            Section::Thought => "<think>\n".to_string(),
            Section::Detail(topic) => format!("<details><summary><b>{}:</b></summary>\n\n", topic),
        }
    }

    fn close_marker(&self) -> String {
        match &self.section {
            Section::Default => String::new(),
            Section::Thought => "\n</think>\n".to_string(),
            Section::Detail(_) => "\n</details>\n".to_string(),
        }
    }

    /// Close whatever section is open and reset to `default`. On the queued transport, also
    /// pushes the empty-string flush sentinel marking end-of-turn.
    pub async fn clear(&mut self) {
        let closing = self.close_marker();
        if !closing.is_empty() {
            self.output_buffer.push_str(&closing);
            if let Some(tx) = &self.queue {
                let _ = tx.send(closing).await;
            }
        }
        self.section = Section::Default;
        if let Some(tx) = &self.queue {
            let _ = tx.send(String::new()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_then_thought_brackets_correctly() {
        let mut w = OutputWriter::stdout();
        w.default("hi").await;
        w.thought("secret").await;
        w.default("done").await;
        assert_eq!(w.output_buffer(), "hi<think>\nsecret\n</think>\ndone");
    }

    #[tokio::test]
    async fn detail_transition_closes_previous_panel() {
        let mut w = OutputWriter::stdout();
        w.detail("plan", "step one").await;
        w.detail("result", "42").await;
        assert_eq!(
            w.output_buffer(),
            "<details><summary><b>plan:</b></summary>\n\nstep one\n</details>\
             <details><summary><b>result:</b></summary>\n\n42"
        );
    }

    #[tokio::test]
    async fn separate_adds_blank_line_within_same_section() {
        let mut w = OutputWriter::stdout();
        w.default("first").await;
        w.write("second", Section::Default, true, false).await;
        assert_eq!(w.output_buffer(), "first\n\nsecond");
    }

    #[tokio::test]
    async fn clean_strips_think_markers_from_payload() {
        let mut w = OutputWriter::stdout();
        w.write("a <think> b </think> c", Section::Default, false, true).await;
        assert_eq!(w.output_buffer(), "a  b  c");
    }
}
