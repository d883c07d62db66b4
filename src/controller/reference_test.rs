//! Tests for the reference resolver

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::super::reference::*;
    use crate::error::{Error, Result};
    use crate::resource::conditions;
    use crate::resource::Conditioned;
    use crate::testing::{Database, DatabaseSpec, MemoryStore, Network, NetworkSpec, Op};

    #[derive(Clone, Copy, PartialEq)]
    enum Panic {
        Never,
        InIsSet,
        InStatus,
        InAssign,
    }

    /// Referencer with a fixed readiness that logs build and assign calls
    struct Scripted {
        name: &'static str,
        state: ReferenceState,
        panic: Panic,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Scripted {
        fn new(name: &'static str, state: ReferenceState, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                state,
                panic: Panic::Never,
                log: log.clone(),
            }
        }

        fn panicking(mut self, panic: Panic) -> Self {
            self.panic = panic;
            self
        }
    }

    #[async_trait]
    impl Referencer<Database> for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn is_set(&self, _mr: &Database) -> bool {
            if self.panic == Panic::InIsSet {
                panic!("reference field of {} cannot be read", self.name);
            }
            true
        }

        async fn get_status(&self, _mr: &Database) -> Result<Vec<ReferenceStatus>> {
            if self.panic == Panic::InStatus {
                panic!("required field of {} is unset", self.name);
            }
            Ok(vec![ReferenceStatus {
                name: self.name.to_string(),
                state: self.state,
            }])
        }

        async fn build(&self, _mr: &Database) -> Result<String> {
            self.log.lock().unwrap().push(format!("build {}", self.name));
            Ok(format!("{}-value", self.name))
        }

        fn assign(&self, mr: &mut Database, value: String) -> Result<()> {
            if self.panic == Panic::InAssign {
                panic!("cannot assign {value}");
            }
            self.log.lock().unwrap().push(format!("assign {}", self.name));
            mr.spec.network_id = Some(value);
            Ok(())
        }
    }

    fn setup() -> (Arc<MemoryStore<Database>>, Database, Arc<Mutex<Vec<String>>>) {
        let store = MemoryStore::with_objects([Database::new("db", DatabaseSpec::default())]);
        let db = store.stored(None, "db").unwrap();
        (store, db, Arc::new(Mutex::new(Vec::new())))
    }

    fn resolver(
        store: &Arc<MemoryStore<Database>>,
        referencers: Vec<Scripted>,
    ) -> ApiReferenceResolver<Database> {
        let referencers = referencers
            .into_iter()
            .map(|r| Arc::new(r) as Arc<dyn Referencer<Database>>)
            .collect();
        ApiReferenceResolver::new(store.clone(), referencers).unwrap()
    }

    #[test]
    fn test_duplicate_referencer_names_are_wiring_defects() {
        let (store, _, log) = setup();
        let referencers: Vec<Arc<dyn Referencer<Database>>> = vec![
            Arc::new(Scripted::new("network", ReferenceState::Ready, &log)),
            Arc::new(Scripted::new("network", ReferenceState::Ready, &log)),
        ];

        let err = ApiReferenceResolver::new(store, referencers).err().unwrap();

        assert!(err.is_wiring());
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_unnamed_referencer_is_a_wiring_defect() {
        let (store, _, log) = setup();
        let referencers: Vec<Arc<dyn Referencer<Database>>> =
            vec![Arc::new(Scripted::new("", ReferenceState::Ready, &log))];

        let err = ApiReferenceResolver::new(store, referencers).err().unwrap();

        assert!(matches!(err, Error::Wiring(_)));
    }

    #[tokio::test]
    async fn test_any_unready_reference_blocks_every_assignment() {
        let (store, mut db, log) = setup();
        let resolver = resolver(
            &store,
            vec![
                Scripted::new("subnet", ReferenceState::Ready, &log),
                Scripted::new("network", ReferenceState::NotReady, &log),
                Scripted::new("key", ReferenceState::NotFound, &log),
            ],
        );

        let err = resolver.resolve_references(&mut db).await.unwrap_err();

        match &err {
            Error::ReferencesNotReady(statuses) => {
                let names: Vec<_> = statuses.iter().map(|s| s.name.as_str()).collect();
                assert_eq!(names, vec!["network", "key"]);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(store.count(Op::Update), 0);
        assert_eq!(db.spec.network_id, None);
    }

    #[tokio::test]
    async fn test_ready_references_are_built_assigned_and_persisted() {
        let (store, mut db, log) = setup();
        let resolver = resolver(
            &store,
            vec![
                Scripted::new("subnet", ReferenceState::Ready, &log),
                Scripted::new("network", ReferenceState::Ready, &log),
            ],
        );

        resolver.resolve_references(&mut db).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["build subnet", "assign subnet", "build network", "assign network"]
        );
        assert_eq!(store.count(Op::Update), 1);
        let stored = store.stored(None, "db").unwrap();
        assert_eq!(stored.spec.network_id.as_deref(), Some("network-value"));
    }

    #[tokio::test]
    async fn test_panic_while_reading_status_becomes_fault() {
        let (store, mut db, log) = setup();
        let resolver = resolver(
            &store,
            vec![Scripted::new("network", ReferenceState::Ready, &log).panicking(Panic::InStatus)],
        );

        let err = resolver.resolve_references(&mut db).await.unwrap_err();

        match err {
            Error::ResolverFault(msg) => {
                assert!(msg.contains("network"));
                assert!(msg.contains("required field of network is unset"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_panic_while_checking_set_references_becomes_fault() {
        let (store, mut db, log) = setup();
        let resolver = resolver(
            &store,
            vec![
                Scripted::new("subnet", ReferenceState::Ready, &log),
                Scripted::new("network", ReferenceState::Ready, &log).panicking(Panic::InIsSet),
            ],
        );

        let err = resolver.resolve_references(&mut db).await.unwrap_err();

        match err {
            Error::ResolverFault(msg) => {
                assert!(msg.contains("reference field of network cannot be read"))
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(store.count(Op::Update), 0);
    }

    #[tokio::test]
    async fn test_panic_while_assigning_becomes_fault() {
        let (store, mut db, log) = setup();
        let resolver = resolver(
            &store,
            vec![Scripted::new("network", ReferenceState::Ready, &log).panicking(Panic::InAssign)],
        );

        let err = resolver.resolve_references(&mut db).await.unwrap_err();

        assert!(matches!(err, Error::ResolverFault(_)));
        assert!(err.is_retriable());
        assert_eq!(store.count(Op::Update), 0);
    }

    #[tokio::test]
    async fn test_resolver_without_set_references_does_nothing() {
        let (store, mut db, _) = setup();
        let networks = Arc::new(MemoryStore::<Network>::new());
        let referencer: Arc<dyn Referencer<Database>> = Arc::new(ObjectReferencer::new(
            "network",
            networks,
            |db: &Database| db.spec.network_ref.clone().map(|name| (None, name)),
            |_: &Network| None,
            |db: &mut Database, id| db.spec.network_id = Some(id),
        ));
        let resolver = ApiReferenceResolver::new(store.clone(), vec![referencer]).unwrap();

        resolver.resolve_references(&mut db).await.unwrap();

        assert_eq!(store.count(Op::Update), 0);
    }

    #[tokio::test]
    async fn test_object_referencer_reports_missing_and_unready_targets() {
        let mut ready = Network::new("ready", NetworkSpec::default());
        ready.set_conditions([conditions::available()]);
        let unready = Network::new("unready", NetworkSpec::default());
        let networks = MemoryStore::with_objects([ready, unready]);
        let referencer: ObjectReferencer<Database, Network> = ObjectReferencer::new(
            "network",
            networks,
            |db: &Database| db.spec.network_ref.clone().map(|name| (None, name)),
            |net: &Network| net.spec.cidr.is_empty().then(|| "10.0.0.0/16".to_string()),
            |db: &mut Database, id| db.spec.network_id = Some(id),
        );

        let mut db = Database::new("db", DatabaseSpec::default());
        let mut state_of = |target: &str| {
            db.spec.network_ref = Some(target.to_string());
            db.clone()
        };
        let missing = referencer.get_status(&state_of("missing")).await.unwrap();
        let unready = referencer.get_status(&state_of("unready")).await.unwrap();
        let ready = referencer.get_status(&state_of("ready")).await.unwrap();

        assert_eq!(missing[0].state, ReferenceState::NotFound);
        assert_eq!(unready[0].state, ReferenceState::NotReady);
        assert_eq!(ready[0].state, ReferenceState::Ready);
        assert_eq!(
            referencer.build(&state_of("ready")).await.unwrap(),
            "10.0.0.0/16"
        );
    }
}
