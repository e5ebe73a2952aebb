use serde::{Deserialize, Serialize};

/// An entry of the fixed topic catalog offered to the learner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub id: String,
    pub emoji: String,
    pub label_vi: String,
    pub label_en: String,
}

impl Topic {
    fn new(id: &str, emoji: &str, label_vi: &str, label_en: &str) -> Self {
        Self {
            id: id.to_string(),
            emoji: emoji.to_string(),
            label_vi: label_vi.to_string(),
            label_en: label_en.to_string(),
        }
    }

    /// The catalog, in display order.
    pub fn catalog() -> Vec<Topic> {
        vec![
            Topic::new("food", "🍔", "Đồ ăn", "Food"),
            Topic::new("travel", "✈️", "Du lịch", "Travel"),
            Topic::new("work", "💼", "Công việc", "Work"),
            Topic::new("home", "🏠", "Nhà cửa", "Home"),
            Topic::new("health", "🏥", "Sức khỏe", "Health"),
            Topic::new("shopping", "🛍️", "Mua sắm", "Shopping"),
        ]
    }

    /// Looks a topic up by id, falling back to a case-insensitive match on
    /// either label.
    pub fn find(key: &str) -> Option<Topic> {
        let key = key.trim();
        Self::catalog().into_iter().find(|topic| {
            topic.id == key
                || topic.label_en.eq_ignore_ascii_case(key)
                || topic.label_vi.to_lowercase() == key.to_lowercase()
        })
    }

    /// Chip text, e.g. "🍔 Đồ ăn".
    pub fn chip_label(&self) -> String {
        format!("{} {}", self.emoji, self.label_vi)
    }
}
