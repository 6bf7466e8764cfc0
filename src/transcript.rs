//! Conversation turns and the streaming transcript accumulator.
//!
//! Transcription fragments stream in for both sides of the exchange while
//! audio is in flight; nothing is committed until the model signals the turn
//! is complete. The finalized log is append-only and outlives the session
//! that produced it.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub speaker: Speaker,
    pub text: String,
}

/// Append-only record of finalized turns.
#[derive(Debug, Default)]
pub struct ConversationLog {
    turns: Vec<Turn>,
}

impl ConversationLog {
    pub fn append(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

/// Collects streaming transcription fragments until a turn completes.
#[derive(Debug, Default)]
pub struct TranscriptAccumulator {
    input_buf: String,
    output_buf: String,
}

impl TranscriptAccumulator {
    pub fn push_input(&mut self, fragment: &str) {
        self.input_buf.push_str(fragment);
    }

    pub fn push_output(&mut self, fragment: &str) {
        self.output_buf.push_str(fragment);
    }

    /// Finalize the exchange into the log: the user's turn first, then the
    /// model's, each only if it has non-whitespace content. Both buffers are
    /// reset either way. Returns how many turns were appended.
    pub fn finish_turn(&mut self, log: &mut ConversationLog) -> usize {
        let mut appended = 0;
        if self.input_buf.trim().is_empty() {
            self.input_buf.clear();
        } else {
            log.append(Turn {
                speaker: Speaker::User,
                text: std::mem::take(&mut self.input_buf),
            });
            appended += 1;
        }
        if self.output_buf.trim().is_empty() {
            self.output_buf.clear();
        } else {
            log.append(Turn {
                speaker: Speaker::Model,
                text: std::mem::take(&mut self.output_buf),
            });
            appended += 1;
        }
        appended
    }

    pub fn reset(&mut self) {
        self.input_buf.clear();
        self.output_buf.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.input_buf.is_empty() && self.output_buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragments_assemble_into_ordered_turns() {
        let mut acc = TranscriptAccumulator::default();
        let mut log = ConversationLog::default();

        acc.push_input("Hel");
        acc.push_input("lo");
        acc.push_output("Hi");
        acc.push_output(" there");

        assert_eq!(acc.finish_turn(&mut log), 2);
        assert_eq!(
            log.turns(),
            &[
                Turn {
                    speaker: Speaker::User,
                    text: "Hello".to_string()
                },
                Turn {
                    speaker: Speaker::Model,
                    text: "Hi there".to_string()
                },
            ]
        );
        assert!(acc.is_empty());
    }

    #[test]
    fn test_whitespace_only_buffers_produce_no_turns() {
        let mut acc = TranscriptAccumulator::default();
        let mut log = ConversationLog::default();

        acc.push_input("   ");
        acc.push_output("\n\t");

        assert_eq!(acc.finish_turn(&mut log), 0);
        assert!(log.is_empty());
        assert!(acc.is_empty(), "buffers must reset even when discarded");
    }

    #[test]
    fn test_one_sided_exchanges() {
        let mut acc = TranscriptAccumulator::default();
        let mut log = ConversationLog::default();

        acc.push_input("just me");
        assert_eq!(acc.finish_turn(&mut log), 1);
        assert_eq!(log.turns()[0].speaker, Speaker::User);

        acc.push_output("just the model");
        assert_eq!(acc.finish_turn(&mut log), 1);
        assert_eq!(log.turns()[1].speaker, Speaker::Model);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_finish_twice_appends_nothing_new() {
        let mut acc = TranscriptAccumulator::default();
        let mut log = ConversationLog::default();

        acc.push_input("once");
        acc.finish_turn(&mut log);
        assert_eq!(acc.finish_turn(&mut log), 0);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_reset_discards_partials() {
        let mut acc = TranscriptAccumulator::default();
        let mut log = ConversationLog::default();

        acc.push_input("half a tho");
        acc.push_output("ugh");
        acc.reset();

        assert_eq!(acc.finish_turn(&mut log), 0);
        assert!(log.is_empty());
    }

    #[test]
    fn test_text_is_appended_untrimmed() {
        // Leading/trailing whitespace inside a real utterance is preserved;
        // only all-whitespace buffers are discarded.
        let mut acc = TranscriptAccumulator::default();
        let mut log = ConversationLog::default();

        acc.push_input(" hello ");
        acc.finish_turn(&mut log);
        assert_eq!(log.turns()[0].text, " hello ");
    }
}
