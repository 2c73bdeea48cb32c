//! Command service for pets.

use std::sync::Arc;

use common::AggregateId;
use domain::{Aggregate, CommitReceipt, DomainError, Repository, Result, UnitOfWork};
use event_bus::EventPublisher;
use event_store::EventStore;

use crate::pet::{Pet, PetError, PetEvent};

/// Runs each command in its own unit of work.
///
/// Commands that lose an optimistic concurrency race are retried from a
/// fresh load up to `max_retries` times.
pub struct PetService<S: EventStore + Clone + 'static> {
    store: S,
    publisher: Option<Arc<dyn EventPublisher>>,
    max_retries: u32,
}

impl<S: EventStore + Clone + 'static> PetService<S> {
    pub fn new(store: S, max_retries: u32) -> Self {
        Self {
            store,
            publisher: None,
            max_retries,
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    fn unit_of_work(&self) -> UnitOfWork<S> {
        let uow = UnitOfWork::new(self.store.clone());
        match &self.publisher {
            Some(publisher) => uow.with_publisher(Arc::clone(publisher)),
            None => uow,
        }
    }

    /// Registers a new pet.
    ///
    /// Registering an id that already has history fails with a
    /// concurrency conflict and is not retried.
    #[tracing::instrument(skip(self))]
    pub async fn register(
        &self,
        pet_id: &AggregateId,
        owner_id: &str,
        name: &str,
        species: &str,
    ) -> Result<CommitReceipt> {
        let event = Pet::register(owner_id, name, species)?;

        let uow = self.unit_of_work();
        uow.begin()?;
        let pets = uow.repository::<Pet>()?;
        let pet = pets.track(Aggregate::create(pet_id.clone(), event))?;
        pets.save(&pet).await?;
        let receipt = uow.commit(None).await?;

        metrics::counter!("demo_commands_total", "command" => "register").increment(1);
        Ok(receipt)
    }

    #[tracing::instrument(skip(self))]
    pub async fn rename(&self, pet_id: &AggregateId, name: &str) -> Result<CommitReceipt> {
        self.execute("rename", pet_id, |pet| pet.rename(name)).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn weigh(&self, pet_id: &AggregateId, grams: u32) -> Result<CommitReceipt> {
        self.execute("weigh", pet_id, |pet| pet.weigh(grams)).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn archive(&self, pet_id: &AggregateId) -> Result<CommitReceipt> {
        self.execute("archive", pet_id, Pet::archive).await
    }

    /// Replays the pet's current state from the store.
    pub async fn get(&self, pet_id: &AggregateId) -> Result<Pet> {
        let pets: Repository<Pet, S> = Repository::new(self.store.clone());
        let handle = pets.get_by_id(pet_id).await?;
        let snapshot = handle.snapshot().await;
        Ok(snapshot.state().clone())
    }

    async fn execute<F>(
        &self,
        command: &'static str,
        pet_id: &AggregateId,
        decide: F,
    ) -> Result<CommitReceipt>
    where
        F: Fn(&Pet) -> std::result::Result<Vec<PetEvent>, PetError>,
    {
        let mut attempt: u32 = 0;
        loop {
            let uow = self.unit_of_work();
            uow.begin()?;
            let pets = uow.repository::<Pet>()?;
            let pet = pets.get_by_id(pet_id).await?;
            pet.lock().await.handle(&decide).map_err(DomainError::from)?;
            pets.save(&pet).await?;

            match uow.commit(None).await {
                Ok(receipt) => {
                    metrics::counter!("demo_commands_total", "command" => command).increment(1);
                    return Ok(receipt);
                }
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    metrics::counter!("demo_command_retries_total", "command" => command)
                        .increment(1);
                    tracing::debug!(attempt, error = %err, "Conflict, retrying from a fresh load");
                    uow.rollback()?;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_bus::SyncEventBus;
    use event_store::{InMemoryEventStore, Version};

    fn service(store: &InMemoryEventStore) -> PetService<InMemoryEventStore> {
        PetService::new(store.clone(), 3)
    }

    #[tokio::test]
    async fn register_then_weigh() {
        let store = InMemoryEventStore::new();
        let pets = service(&store);
        let id = AggregateId::from("pet-1");

        pets.register(&id, "owner-1", "Rex", "dog").await.unwrap();
        let receipt = pets.weigh(&id, 3200).await.unwrap();
        assert_eq!(receipt.events[0].version, Version::new(2));

        let pet = pets.get(&id).await.unwrap();
        assert_eq!(pet.weight_grams, Some(3200));
    }

    #[tokio::test]
    async fn rejected_command_stores_nothing() {
        let store = InMemoryEventStore::new();
        let pets = service(&store);
        let id = AggregateId::from("pet-1");
        pets.register(&id, "owner-1", "Rex", "dog").await.unwrap();

        let err = pets.rename(&id, "").await.unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert_eq!(store.current_version(&id).await.unwrap(), Version::first());
    }

    #[tokio::test]
    async fn duplicate_registration_conflicts() {
        let store = InMemoryEventStore::new();
        let pets = service(&store);
        let id = AggregateId::from("pet-1");
        pets.register(&id, "owner-1", "Rex", "dog").await.unwrap();

        let err = pets
            .register(&id, "owner-2", "Max", "cat")
            .await
            .unwrap_err();
        assert!(err.is_concurrency_conflict());
        assert_eq!(pets.get(&id).await.unwrap().name, "Rex");
    }

    #[tokio::test]
    async fn unknown_pet_is_not_found() {
        let store = InMemoryEventStore::new();
        let err = service(&store)
            .weigh(&AggregateId::from("missing"), 100)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_commands_all_land_with_retries() {
        let store = InMemoryEventStore::new();
        let pets = Arc::new(PetService::new(store.clone(), 32));
        let id = AggregateId::from("pet-1");
        pets.register(&id, "owner-1", "Rex", "dog").await.unwrap();

        let mut tasks = Vec::new();
        for grams in 1..=8u32 {
            let pets = Arc::clone(&pets);
            let id = id.clone();
            tasks.push(tokio::spawn(async move { pets.weigh(&id, grams * 100).await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(store.current_version(&id).await.unwrap(), Version::new(9));
        assert_eq!(pets.get(&id).await.unwrap().weighings, 8);
    }

    #[tokio::test]
    async fn publishes_through_configured_bus() {
        let store = InMemoryEventStore::new();
        let bus = Arc::new(SyncEventBus::new());
        let seen = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe_all(event_bus::handler_fn("sink", move |event| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().await.push(event.event_type);
                Ok::<_, event_bus::HandlerError>(())
            }
        }))
        .await;

        let pets = service(&store).with_publisher(bus);
        let id = AggregateId::from("pet-1");
        pets.register(&id, "owner-1", "Rex", "dog").await.unwrap();
        pets.archive(&id).await.unwrap();

        assert_eq!(*seen.lock().await, vec!["PetRegistered", "PetArchived"]);
    }
}
