//! Practice exercises, answer scoring and multiple-choice option sets.

use crate::{
    error::GenerationError,
    schema::{EXERCISES_PER_WORD, GeneratedPracticeRound},
    vocab::WordEntry,
};
use rand::{Rng, seq::SliceRandom};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Placeholder option used when too few distinct distractors exist.
/// Clients should render it as a disabled choice.
pub const FILLER_OPTION: &str = "---";
/// Size of every multiple-choice option set.
pub const OPTION_COUNT: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExerciseKind {
    FillBlank,
    MultipleChoice,
    Translate,
}

impl ExerciseKind {
    /// Parses the model's type string. Anything unrecognised becomes
    /// [`ExerciseKind::Translate`].
    pub fn from_generated(kind: &str) -> Self {
        match kind.trim() {
            "fillBlank" => Self::FillBlank,
            "multipleChoice" => Self::MultipleChoice,
            _ => Self::Translate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exercise {
    pub id: Uuid,
    pub kind: ExerciseKind,
    pub prompt: String,
    pub correct_answer: String,
    /// Empty unless `kind` is multiple choice.
    pub options: Vec<String>,
    pub word: WordEntry,
}

impl Exercise {
    pub fn new(
        kind: ExerciseKind,
        prompt: impl Into<String>,
        correct_answer: impl Into<String>,
        options: Vec<String>,
        word: WordEntry,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            prompt: prompt.into(),
            correct_answer: correct_answer.into(),
            options,
            word,
        }
    }

    pub fn is_correct(&self, answer: &str) -> bool {
        score_answer(answer, &self.correct_answer)
    }
}

fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Exact comparison after trimming and lowercasing both sides.
pub fn score_answer(answer: &str, correct_answer: &str) -> bool {
    normalize(answer) == normalize(correct_answer)
}

pub fn is_filler(option: &str) -> bool {
    option == FILLER_OPTION
}

/// Builds a shuffled option set of exactly [`OPTION_COUNT`] entries.
///
/// The correct answer appears once. Distractors come from `pool` in order,
/// deduplicated and never equal to the correct answer; missing slots are
/// filled with [`FILLER_OPTION`].
pub fn build_options<R: Rng + ?Sized>(correct: &str, pool: &[String], rng: &mut R) -> Vec<String> {
    let correct = correct.trim();
    let mut seen = HashSet::from([normalize(correct)]);
    let mut options = vec![correct.to_string()];

    for candidate in pool {
        if options.len() == OPTION_COUNT {
            break;
        }
        let candidate = candidate.trim();
        if candidate.is_empty() || is_filler(candidate) {
            continue;
        }
        if seen.insert(normalize(candidate)) {
            options.push(candidate.to_string());
        }
    }
    while options.len() < OPTION_COUNT {
        options.push(FILLER_OPTION.to_string());
    }

    options.shuffle(rng);
    options
}

/// Maps a generated batch onto exercises for `words`.
///
/// Keeps at most [`EXERCISES_PER_WORD`] per word, assigns exercise `i` to
/// word `i / 2`, drops entries without a prompt or answer and rebuilds every
/// multiple-choice option set. The model's own options are preferred as
/// distractors, then the translations of the sibling words.
pub fn exercises_from_generated<R: Rng + ?Sized>(
    generated: GeneratedPracticeRound,
    words: &[WordEntry],
    rng: &mut R,
) -> Result<Vec<Exercise>, GenerationError> {
    if words.is_empty() {
        return Err(GenerationError::failed("no words to practice"));
    }
    let limit = words.len() * EXERCISES_PER_WORD;
    let siblings: Vec<String> = words.iter().map(|w| w.vietnamese.clone()).collect();

    let exercises: Vec<Exercise> = generated
        .exercises
        .into_iter()
        .take(limit)
        .enumerate()
        .filter_map(|(i, ex)| {
            if ex.prompt.trim().is_empty() || ex.correct_answer.trim().is_empty() {
                return None;
            }
            let word = words[(i / EXERCISES_PER_WORD).min(words.len() - 1)].clone();
            let kind = ExerciseKind::from_generated(&ex.kind);
            let options = match kind {
                ExerciseKind::MultipleChoice => {
                    let pool: Vec<String> = ex.options.into_iter().chain(siblings.clone()).collect();
                    build_options(&ex.correct_answer, &pool, &mut *rng)
                }
                _ => Vec::new(),
            };
            Some(Exercise::new(
                kind,
                ex.prompt.trim(),
                ex.correct_answer.trim(),
                options,
                word,
            ))
        })
        .collect();

    if exercises.is_empty() {
        return Err(GenerationError::failed("model returned no usable exercises"));
    }
    Ok(exercises)
}

/// One learner answer. Never mutated once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExerciseResult {
    pub exercise_id: Uuid,
    pub answer: String,
    pub is_correct: bool,
}

impl ExerciseResult {
    pub fn grade(exercise: &Exercise, answer: &str) -> Self {
        Self {
            exercise_id: exercise.id,
            answer: answer.to_string(),
            is_correct: exercise.is_correct(answer),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PracticeRound {
    exercises: Vec<Exercise>,
    results: Vec<ExerciseResult>,
}

impl PracticeRound {
    pub fn new(exercises: Vec<Exercise>) -> Self {
        Self {
            exercises,
            results: Vec::new(),
        }
    }

    pub fn exercises(&self) -> &[Exercise] {
        &self.exercises
    }

    pub fn results(&self) -> &[ExerciseResult] {
        &self.results
    }

    /// The exercise waiting for an answer, if any.
    pub fn current(&self) -> Option<&Exercise> {
        self.exercises.get(self.results.len())
    }

    pub fn is_last(&self) -> bool {
        self.results.len() + 1 == self.exercises.len()
    }

    pub fn is_complete(&self) -> bool {
        self.results.len() >= self.exercises.len()
    }

    /// Appends a result for the current exercise. Ignored once every
    /// exercise has a result.
    pub fn record(&mut self, result: ExerciseResult) -> bool {
        if self.is_complete() {
            return false;
        }
        self.results.push(result);
        true
    }

    /// Same exercises, no results.
    pub fn restarted(&self) -> Self {
        Self::new(self.exercises.clone())
    }

    pub fn correct_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_correct).count()
    }

    pub fn exercise(&self, id: Uuid) -> Option<&Exercise> {
        self.exercises.iter().find(|e| e.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::GeneratedExercise;
    use rand::{SeedableRng, rngs::StdRng};

    fn words() -> Vec<WordEntry> {
        vec![
            WordEntry::new("delicious", "ngon", "adjective", "This soup is delicious."),
            WordEntry::new("hungry", "đói", "adjective", "I am very hungry."),
            WordEntry::new("cook", "nấu ăn", "verb", "She loves to cook dinner."),
        ]
    }

    fn generated(kind: &str, answer: &str, options: &[&str]) -> GeneratedExercise {
        GeneratedExercise {
            kind: kind.into(),
            prompt: format!("prompt for {answer}"),
            correct_answer: answer.into(),
            options: options.iter().map(|o| o.to_string()).collect(),
        }
    }

    #[test]
    fn test_score_answer_trims_and_ignores_case() {
        assert!(score_answer(" Delicious ", "delicious"));
        assert!(score_answer("NGON", "ngon "));
        assert!(!score_answer("delicous", "delicious"));
        assert!(!score_answer("delicious food", "delicious"));
        assert!(!score_answer("", "delicious"));
    }

    #[test]
    fn test_build_options_pads_with_filler() {
        let mut rng = StdRng::seed_from_u64(7);
        let options = build_options("ngon", &["đói".to_string()], &mut rng);
        assert_eq!(options.len(), OPTION_COUNT);
        assert_eq!(options.iter().filter(|o| *o == "ngon").count(), 1);
        assert_eq!(options.iter().filter(|o| is_filler(o)).count(), 2);
        assert!(options.contains(&"đói".to_string()));
    }

    #[test]
    fn test_build_options_dedups_and_excludes_correct() {
        let mut rng = StdRng::seed_from_u64(1);
        let pool: Vec<String> = ["Ngon", "đói", "ĐÓI", " nấu ăn ", "cay", "mặn"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let options = build_options("ngon", &pool, &mut rng);
        let mut sorted = options.clone();
        sorted.sort();
        assert_eq!(sorted, vec!["cay", "ngon", "nấu ăn", "đói"]);
    }

    #[test]
    fn test_build_options_is_a_permutation_for_any_seed() {
        let pool: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
        for seed in 0..32 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut options = build_options("x", &pool, &mut rng);
            options.sort();
            assert_eq!(options, vec!["a", "b", "c", "x"]);
        }
    }

    #[test]
    fn test_exercises_from_generated_maps_kinds_and_words() {
        let mut rng = StdRng::seed_from_u64(3);
        let round = GeneratedPracticeRound {
            exercises: vec![
                generated("multipleChoice", "ngon", &["ngon", "đói", "mặn", "ngọt"]),
                generated("translate", "delicious", &[]),
                generated("fillBlank", "hungry", &[]),
                generated("essay", "đói", &[]),
                generated("multipleChoice", "nấu ăn", &[]),
                generated("translate", "cook", &[]),
                generated("translate", "extra", &[]),
            ],
        };
        let words = words();
        let exercises = exercises_from_generated(round, &words, &mut rng).unwrap();

        assert_eq!(exercises.len(), 6);
        assert_eq!(exercises[0].kind, ExerciseKind::MultipleChoice);
        assert_eq!(exercises[3].kind, ExerciseKind::Translate);
        assert_eq!(exercises[0].word.english, "delicious");
        assert_eq!(exercises[2].word.english, "hungry");
        assert_eq!(exercises[5].word.english, "cook");
        for exercise in &exercises {
            match exercise.kind {
                ExerciseKind::MultipleChoice => {
                    assert_eq!(exercise.options.len(), OPTION_COUNT);
                    let hits = exercise
                        .options
                        .iter()
                        .filter(|o| score_answer(o, &exercise.correct_answer))
                        .count();
                    assert_eq!(hits, 1);
                }
                _ => assert!(exercise.options.is_empty()),
            }
        }
    }

    #[test]
    fn test_exercises_from_generated_rejects_empty_batch() {
        let mut rng = StdRng::seed_from_u64(3);
        let round = GeneratedPracticeRound {
            exercises: vec![generated("translate", " ", &[])],
        };
        let err = exercises_from_generated(round, &words(), &mut rng).unwrap_err();
        assert!(matches!(err, GenerationError::GenerationFailed(_)));
    }

    #[test]
    fn test_round_never_records_past_the_end() {
        let words = words();
        let exercises = vec![
            Exercise::new(ExerciseKind::Translate, "p1", "ngon", vec![], words[0].clone()),
            Exercise::new(ExerciseKind::Translate, "p2", "đói", vec![], words[1].clone()),
        ];
        let mut round = PracticeRound::new(exercises);
        let first = ExerciseResult::grade(round.current().unwrap(), "NGON");
        assert!(first.is_correct);
        assert!(round.record(first));
        assert!(round.is_last());
        let second = ExerciseResult::grade(round.current().unwrap(), "no");
        assert!(round.record(second.clone()));
        assert!(round.is_complete());
        assert!(!round.record(second));
        assert_eq!(round.results().len(), 2);
        assert_eq!(round.correct_count(), 1);

        let restarted = round.restarted();
        assert!(restarted.results().is_empty());
        assert_eq!(restarted.exercises(), round.exercises());
        assert_eq!(restarted, restarted.restarted());
    }
}
