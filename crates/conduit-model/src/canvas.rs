use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An organization-scoped workspace holding stages and event sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Canvas {
  pub id: Uuid,
  pub organization_id: Uuid,
  pub name: String,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

/// A named external trigger endpoint attached to a canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSource {
  pub id: Uuid,
  pub organization_id: Uuid,
  pub canvas_id: Uuid,
  pub name: String,
  /// Signing key as ciphertext. Never serialized.
  #[serde(skip)]
  pub key: Vec<u8>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}
