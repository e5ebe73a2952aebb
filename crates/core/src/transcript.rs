use serde::{Deserialize, Serialize};

/// Author of a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Instructions,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub content: String,
}

impl TranscriptEntry {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Ordered history of one model session. The first entry holds the
/// session instructions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    /// Starts a transcript seeded with the session instructions.
    pub fn with_instructions(instructions: impl Into<String>) -> Self {
        Self {
            entries: vec![TranscriptEntry::new(Role::Instructions, instructions)],
        }
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, role: Role, content: impl Into<String>) {
        self.entries.push(TranscriptEntry::new(role, content));
    }

    /// Appends one completed prompt/reply pair.
    pub fn push_exchange(&mut self, prompt: &str, reply: &str) {
        self.push(Role::User, prompt);
        self.push(Role::Assistant, reply);
    }

    /// Keeps the first entry and, when there is more than one entry, the last.
    /// Everything in between is dropped for good.
    pub fn condensed(&self) -> Self {
        let mut entries = Vec::with_capacity(2);
        if let Some(first) = self.entries.first() {
            entries.push(first.clone());
        }
        if self.entries.len() > 1 {
            if let Some(last) = self.entries.last() {
                entries.push(last.clone());
            }
        }
        Self { entries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_transcript(turns: usize) -> Transcript {
        let mut transcript = Transcript::with_instructions("be kind");
        for i in 0..turns {
            transcript.push_exchange(&format!("question {i}"), &format!("answer {i}"));
        }
        transcript
    }

    #[test]
    fn test_condensed_keeps_first_and_last() {
        let transcript = long_transcript(4);
        assert_eq!(transcript.len(), 9);

        let condensed = transcript.condensed();
        assert_eq!(condensed.len(), 2);
        assert_eq!(condensed.entries()[0], transcript.entries()[0]);
        assert_eq!(condensed.entries()[1].content, "answer 3");
        assert_eq!(condensed.entries()[1].role, Role::Assistant);
    }

    #[test]
    fn test_condensed_single_entry() {
        let transcript = Transcript::with_instructions("only instructions");
        let condensed = transcript.condensed();
        assert_eq!(condensed, transcript);
    }

    #[test]
    fn test_condensed_empty() {
        assert!(Transcript::default().condensed().is_empty());
    }

    #[test]
    fn test_condensed_is_stable() {
        let once = long_transcript(3).condensed();
        assert_eq!(once.condensed(), once);
    }
}
