//! Sample aggregate: a pet registered at a veterinary clinic.

use domain::{AggregateState, DomainError, DomainEvent};
use serde::{Deserialize, Serialize};
use thiserror::Error;

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

/// Business rule violations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PetError {
    #[error("Pet is archived")]
    Archived,
    #[error("Pet name cannot be empty")]
    EmptyName,
    #[error("Species cannot be empty")]
    EmptySpecies,
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
    /// Validates a registration and returns the creation event.
    pub fn register(owner_id: &str, name: &str, species: &str) -> Result<PetEvent, PetError> {
        if name.trim().is_empty() {
            return Err(PetError::EmptyName);
        }
        if species.trim().is_empty() {
            return Err(PetError::EmptySpecies);
        }
        Ok(PetEvent::PetRegistered {
            owner_id: owner_id.to_string(),
            name: name.to_string(),
            species: species.to_string(),
        })
    }

    pub fn rename(&self, name: &str) -> Result<Vec<PetEvent>, PetError> {
        self.ensure_active()?;
        if name.trim().is_empty() {
            return Err(PetError::EmptyName);
        }
        if name == self.name {
            return Ok(vec![]);
        }
        Ok(vec![PetEvent::PetRenamed {
            name: name.to_string(),
        }])
    }

    pub fn weigh(&self, grams: u32) -> Result<Vec<PetEvent>, PetError> {
        self.ensure_active()?;
        if grams == 0 {
            return Err(PetError::InvalidWeight);
        }
        Ok(vec![PetEvent::PetWeighed { grams }])
    }

    pub fn archive(&self) -> Result<Vec<PetEvent>, PetError> {
        self.ensure_active()?;
        Ok(vec![PetEvent::PetArchived])
    }

    fn ensure_active(&self) -> Result<(), PetError> {
        if self.archived {
            return Err(PetError::Archived);
        }
        Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;
    use common::AggregateId;
    use domain::Aggregate;

    fn registered() -> Aggregate<Pet> {
        let event = Pet::register("owner-1", "Rex", "dog").unwrap();
        Aggregate::create(AggregateId::from("pet-1"), event)
    }

    #[test]
    fn registration_requires_name_and_species() {
        assert_eq!(Pet::register("o", " ", "dog"), Err(PetError::EmptyName));
        assert_eq!(Pet::register("o", "Rex", ""), Err(PetError::EmptySpecies));
    }

    #[test]
    fn weighing_tracks_latest_weight() {
        let mut pet = registered();
        pet.handle(|s| s.weigh(2400)).unwrap();
        pet.handle(|s| s.weigh(2500)).unwrap();

        assert_eq!(pet.state().weight_grams, Some(2500));
        assert_eq!(pet.state().weighings, 2);
        assert_eq!(pet.version().as_i64(), 3);
    }

    #[test]
    fn renaming_to_same_name_raises_nothing() {
        let mut pet = registered();
        assert_eq!(pet.handle(|s| s.rename("Rex")).unwrap(), 0);
        assert_eq!(pet.uncommitted_events().len(), 1);
    }

    #[test]
    fn archived_pet_rejects_commands() {
        let mut pet = registered();
        pet.handle(|s| s.archive()).unwrap();

        assert_eq!(pet.handle(|s| s.weigh(100)), Err(PetError::Archived));
        assert_eq!(pet.handle(|s| s.rename("Max")), Err(PetError::Archived));
        assert_eq!(pet.version().as_i64(), 2);
    }

    #[test]
    fn pet_errors_map_to_validation() {
        let err: DomainError = PetError::InvalidWeight.into();
        assert!(matches!(err, DomainError::Validation(msg) if msg.contains("greater than 0")));
    }
}
