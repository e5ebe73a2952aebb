//! API Models
//!
//! Response bodies of the REST endpoints, documented with `utoipa` for the
//! OpenAPI output.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use vocab_tutor_core::{Availability, topic::Topic};

/// Whether the configured language model can serve requests.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct AvailabilityResponse {
    pub available: bool,
    /// Learner-facing explanation, present only when unavailable.
    #[schema(example = "Mô hình AI đang tải xuống. Vui lòng thử lại sau.")]
    pub reason: Option<String>,
}

impl From<Availability> for AvailabilityResponse {
    fn from(availability: Availability) -> Self {
        Self {
            available: availability.is_available(),
            reason: availability.reason(),
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct TopicView {
    #[schema(example = "food")]
    pub id: String,
    #[schema(example = "🍔")]
    pub emoji: String,
    #[schema(example = "Đồ ăn")]
    pub label_vi: String,
    #[schema(example = "Food")]
    pub label_en: String,
}

impl From<Topic> for TopicView {
    fn from(topic: Topic) -> Self {
        Self {
            id: topic.id,
            emoji: topic.emoji,
            label_vi: topic.label_vi,
            label_en: topic.label_en,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}
