//! Aggregates and handlers shared by the integration suites.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use domain::{AggregateState, DomainError, DomainEvent};
use event_bus::{EventHandler, HandlerError};
use event_store::EventEnvelope;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PetEvent {
    PetRegistered {
        owner_id: String,
        name: String,
        species: String,
    },
    PetRenamed {
        name: String,
    },
    PetWeighed {
        grams: u32,
    },
    PetArchived,
}

impl DomainEvent for PetEvent {
    fn event_type(&self) -> &'static str {
        match self {
            PetEvent::PetRegistered { .. } => "PetRegistered",
            PetEvent::PetRenamed { .. } => "PetRenamed",
            PetEvent::PetWeighed { .. } => "PetWeighed",
            PetEvent::PetArchived => "PetArchived",
        }
    }
}

#[derive(Debug, Error)]
pub enum PetError {
    #[error("Pet is archived")]
    Archived,
    #[error("Pet name cannot be empty")]
    EmptyName,
    #[error("Weight must be greater than 0")]
    InvalidWeight,
}

impl From<PetError> for DomainError {
    fn from(err: PetError) -> Self {
        DomainError::Validation(err.to_string())
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Pet {
    pub owner_id: String,
    pub name: String,
    pub species: String,
    pub weight_grams: Option<u32>,
    pub weighings: u32,
    pub archived: bool,
}

impl Pet {
    pub fn registered(owner_id: &str, name: &str, species: &str) -> PetEvent {
        PetEvent::PetRegistered {
            owner_id: owner_id.to_string(),
            name: name.to_string(),
            species: species.to_string(),
        }
    }

    pub fn rename(&self, name: &str) -> Result<Vec<PetEvent>, PetError> {
        if self.archived {
            return Err(PetError::Archived);
        }
        if name.trim().is_empty() {
            return Err(PetError::EmptyName);
        }
        Ok(vec![PetEvent::PetRenamed {
            name: name.to_string(),
        }])
    }

    pub fn weigh(&self, grams: u32) -> Result<Vec<PetEvent>, PetError> {
        if self.archived {
            return Err(PetError::Archived);
        }
        if grams == 0 {
            return Err(PetError::InvalidWeight);
        }
        Ok(vec![PetEvent::PetWeighed { grams }])
    }

    pub fn archive(&self) -> Result<Vec<PetEvent>, PetError> {
        if self.archived {
            return Err(PetError::Archived);
        }
        Ok(vec![PetEvent::PetArchived])
    }
}

impl AggregateState for Pet {
    type Event = PetEvent;

    fn aggregate_type() -> &'static str {
        "Pet"
    }

    fn apply(&mut self, event: &PetEvent) {
        match event {
            PetEvent::PetRegistered {
                owner_id,
                name,
                species,
            } => {
                self.owner_id = owner_id.clone();
                self.name = name.clone();
                self.species = species.clone();
            }
            PetEvent::PetRenamed { name } => self.name = name.clone(),
            PetEvent::PetWeighed { grams } => {
                self.weight_grams = Some(*grams);
                self.weighings += 1;
            }
            PetEvent::PetArchived => self.archived = true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PaymentEvent {
    PaymentInitiated { pet_id: String, amount_cents: i64 },
    PaymentCaptured,
    PaymentRefunded { amount_cents: i64 },
}

impl DomainEvent for PaymentEvent {
    fn event_type(&self) -> &'static str {
        match self {
            PaymentEvent::PaymentInitiated { .. } => "PaymentInitiated",
            PaymentEvent::PaymentCaptured => "PaymentCaptured",
            PaymentEvent::PaymentRefunded { .. } => "PaymentRefunded",
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Payment {
    pub pet_id: String,
    pub amount_cents: i64,
    pub refunded_cents: i64,
    pub captured: bool,
}

impl AggregateState for Payment {
    type Event = PaymentEvent;

    fn aggregate_type() -> &'static str {
        "Payment"
    }

    fn apply(&mut self, event: &PaymentEvent) {
        match event {
            PaymentEvent::PaymentInitiated {
                pet_id,
                amount_cents,
            } => {
                self.pet_id = pet_id.clone();
                self.amount_cents = *amount_cents;
            }
            PaymentEvent::PaymentCaptured => self.captured = true,
            PaymentEvent::PaymentRefunded { amount_cents } => self.refunded_cents += amount_cents,
        }
    }
}

/// Handler that records every event it sees and optionally fails.
pub struct Recorder {
    name: String,
    fail: bool,
    pub seen: Arc<Mutex<Vec<EventEnvelope>>>,
}

impl Recorder {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            fail: false,
            seen: Arc::default(),
        })
    }

    pub fn failing(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            fail: true,
            seen: Arc::default(),
        })
    }

    pub async fn event_types(&self) -> Vec<String> {
        self.seen
            .lock()
            .await
            .iter()
            .map(|e| e.event_type.clone())
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.seen.lock().await.len()
    }
}

#[async_trait]
impl EventHandler for Recorder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError> {
        self.seen.lock().await.push(event.clone());
        if self.fail {
            return Err(HandlerError::new(format!("{} rejected the event", self.name)));
        }
        Ok(())
    }
}
