use crate::schema::{GeneratedFlashcard, WordSet};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// A vocabulary word produced by one generation batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordEntry {
    pub id: Uuid,
    pub english: String,
    pub vietnamese: String,
    pub part_of_speech: String,
    pub example_sentence: String,
}

impl WordEntry {
    pub fn new(english: &str, vietnamese: &str, part_of_speech: &str, example: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            english: english.to_string(),
            vietnamese: vietnamese.to_string(),
            part_of_speech: part_of_speech.to_string(),
            example_sentence: example.to_string(),
        }
    }

    /// Maps a generated batch onto word entries. Blank words and repeated
    /// english terms (case-insensitive) are dropped.
    pub fn from_word_set(set: WordSet) -> Vec<WordEntry> {
        let mut seen = HashSet::new();
        set.words
            .into_iter()
            .filter_map(|w| {
                let english = w.english.trim();
                let vietnamese = w.vietnamese.trim();
                if english.is_empty() || vietnamese.is_empty() {
                    return None;
                }
                if !seen.insert(english.to_lowercase()) {
                    return None;
                }
                Some(WordEntry::new(
                    english,
                    vietnamese,
                    w.part_of_speech.trim(),
                    w.example_sentence.trim(),
                ))
            })
            .collect()
    }
}

/// A study card derived from one selected word.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flashcard {
    pub id: Uuid,
    pub word: WordEntry,
    pub mnemonic_vi: String,
    pub example_en: String,
    pub example_vi: String,
    pub phonetic_vi: String,
    pub phonetic_en: String,
    /// Illustration, attached later if the image pipeline produces one.
    pub image: Option<String>,
}

impl Flashcard {
    pub fn from_generated(word: WordEntry, generated: GeneratedFlashcard) -> Self {
        let example_en = if generated.example_en.trim().is_empty() {
            word.example_sentence.clone()
        } else {
            generated.example_en
        };
        Self {
            id: Uuid::new_v4(),
            word,
            mnemonic_vi: generated.mnemonic_vi,
            example_en,
            example_vi: generated.example_vi,
            phonetic_vi: generated.phonetic_vi,
            phonetic_en: generated.phonetic_en,
            image: None,
        }
    }
}
