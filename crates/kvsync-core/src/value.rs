//! Single key and children watches

use std::future::Future;
use std::sync::Arc;

use crate::error::ClientResult;
use crate::event::{SubscribeOptions, Value};
use crate::key::Key;
use crate::primitives::{Connection, Subscription};
use crate::watch::{Reducer, Watch};

/// Live value of one key
pub type ValueWatch = Watch<ValueState>;

/// Live children of a parent key
pub type ChildrenWatch = Watch<ChildrenState>;

/// Current value of the bound key; `None` while the key does not exist
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueState {
    key: Option<Key>,
    value: Option<Value>,
}

impl ValueState {
    pub fn key(&self) -> Option<&Key> {
        self.key.as_ref()
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }
}

impl Reducer for ValueState {
    type Target = Key;
    type Item = Option<Value>;
    type Snapshot = Option<Value>;

    fn open<'a, C: Connection>(
        connection: &'a C,
        target: &'a Key,
        options: SubscribeOptions,
    ) -> impl Future<Output = ClientResult<Subscription<Option<Value>>>> + Send + 'a {
        connection.subscribe(target, options)
    }

    fn reset(&mut self, target: &Key) {
        self.key = Some(target.clone());
        self.value = None;
    }

    fn fold(&mut self, bound: &Key, item: Option<Value>) -> bool {
        if self.key.as_ref() != Some(bound) {
            self.reset(bound);
        }
        if self.value == item {
            return false;
        }
        self.value = item;
        true
    }

    fn snapshot(&self) -> Option<Value> {
        self.value.clone()
    }
}

/// Direct children of the bound parent (the root when the parent is `None`)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChildrenState {
    parent: Option<Key>,
    children: Arc<Vec<String>>,
}

impl ChildrenState {
    pub fn parent(&self) -> Option<&Key> {
        self.parent.as_ref()
    }

    pub fn children(&self) -> &[String] {
        &self.children
    }
}

impl Reducer for ChildrenState {
    type Target = Option<Key>;
    type Item = Vec<String>;
    type Snapshot = Arc<Vec<String>>;

    fn open<'a, C: Connection>(
        connection: &'a C,
        target: &'a Option<Key>,
        _options: SubscribeOptions,
    ) -> impl Future<Output = ClientResult<Subscription<Vec<String>>>> + Send + 'a {
        connection.subscribe_ls(target.as_ref())
    }

    fn reset(&mut self, target: &Option<Key>) {
        self.parent = target.clone();
        self.children = Arc::default();
    }

    fn fold(&mut self, bound: &Option<Key>, item: Vec<String>) -> bool {
        if self.parent != *bound {
            self.reset(bound);
        }
        if *self.children == item {
            return false;
        }
        self.children = Arc::new(item);
        true
    }

    fn snapshot(&self) -> Arc<Vec<String>> {
        self.children.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use crate::primitives::Transport;
    use serde_json::json;
    use tokio::sync::watch;

    fn key(raw: &str) -> Key {
        Key::parse(raw).unwrap()
    }

    #[test]
    fn test_value_publishes_only_changes() {
        let k = key("a");
        let mut state = ValueState::default();
        state.reset(&k);

        assert!(state.fold(&k, Some(json!(1))));
        assert!(!state.fold(&k, Some(json!(1))));
        assert!(state.fold(&k, None));
        assert_eq!(state.snapshot(), None);
    }

    #[test]
    fn test_children_publish_only_changes() {
        let mut state = ChildrenState::default();
        state.reset(&None);

        assert!(state.fold(&None, vec!["a".to_string()]));
        assert!(!state.fold(&None, vec!["a".to_string()]));
        assert_eq!(state.children(), ["a"]);
    }

    #[tokio::test]
    async fn test_value_watch_follows_key() {
        let transport = MemoryTransport::default();
        let conn = Arc::new(transport.connect("memory://test", None, None, None).await.unwrap());
        let (_tx, rx) = watch::channel(Some(conn.clone()));

        let watch: ValueWatch =
            Watch::spawn(rx, key("door"), SubscribeOptions::default(), ValueState::default());
        let mut values = watch.subscribe();
        while transport.store().subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }

        conn.set(&key("door"), json!("open")).await.unwrap();
        values
            .wait_for(|v| *v == Some(json!("open")))
            .await
            .unwrap();

        conn.delete(&key("door")).await.unwrap();
        values.wait_for(Option::is_none).await.unwrap();
    }

    #[tokio::test]
    async fn test_children_watch_follows_parent() {
        let transport = MemoryTransport::default();
        transport.store().set(&key("rooms/kitchen/light"), json!(true));
        let conn = Arc::new(transport.connect("memory://test", None, None, None).await.unwrap());
        let (_tx, rx) = watch::channel(Some(conn.clone()));

        let watch: ChildrenWatch = Watch::spawn(
            rx,
            Some(key("rooms")),
            SubscribeOptions::default(),
            ChildrenState::default(),
        );
        let mut children = watch.subscribe();
        children.wait_for(|c| c.len() == 1).await.unwrap();

        conn.set(&key("rooms/hall/light"), json!(false)).await.unwrap();
        let list = children.wait_for(|c| c.len() == 2).await.unwrap().clone();
        assert_eq!(*list, vec!["hall".to_string(), "kitchen".to_string()]);
    }
}
