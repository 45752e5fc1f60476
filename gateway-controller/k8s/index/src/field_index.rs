use crate::Error;
use ahash::AHashMap as HashMap;
use kube::{runtime::reflector::Store, Resource};
use oke_gateway_controller_k8s_api::{Gateway, HttpRoute};
use parking_lot::RwLock;
use std::sync::Arc;

type IndexFn<K> = Arc<dyn Fn(&K) -> Vec<String> + Send + Sync>;

/// Named secondary keys over a reflector store.
pub struct FieldIndex<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    store: Store<K>,
    fields: Arc<RwLock<HashMap<&'static str, IndexFn<K>>>>,
}

/// The field indexes of every kind the watches model looks up.
#[derive(Clone)]
pub struct Indexer {
    pub gateways: FieldIndex<Gateway>,
    pub http_routes: FieldIndex<HttpRoute>,
}

// === impl FieldIndex ===

impl<K> FieldIndex<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    pub fn new(store: Store<K>) -> Self {
        Self {
            store,
            fields: Default::default(),
        }
    }

    pub fn index_field<F>(&self, field: &'static str, f: F) -> Result<(), Error>
    where
        F: Fn(&K) -> Vec<String> + Send + Sync + 'static,
    {
        let mut fields = self.fields.write();
        if fields.contains_key(field) {
            return Err(Error::DuplicateIndex(field));
        }
        fields.insert(field, Arc::new(f));
        Ok(())
    }

    /// Lists the cached objects that produce `key` for `field`.
    pub fn list(&self, field: &str, key: &str) -> Result<Vec<Arc<K>>, Error> {
        let index = self
            .fields
            .read()
            .get(field)
            .cloned()
            .ok_or_else(|| Error::UnknownIndex(field.to_string()))?;
        Ok(self
            .store
            .state()
            .into_iter()
            .filter(|obj| index(obj).iter().any(|k| k == key))
            .collect())
    }

    pub fn store(&self) -> &Store<K> {
        &self.store
    }
}

impl<K> Clone for FieldIndex<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            fields: self.fields.clone(),
        }
    }
}

// === impl Indexer ===

impl Indexer {
    pub fn new(gateways: Store<Gateway>, http_routes: Store<HttpRoute>) -> Self {
        Self {
            gateways: FieldIndex::new(gateways),
            http_routes: FieldIndex::new(http_routes),
        }
    }
}
