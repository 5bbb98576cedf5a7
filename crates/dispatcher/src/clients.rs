//! 各后端HTTP客户端的集合
//!
//! 后端注册时创建客户端，移除时销毁。工厂作为seam注入，测试中替换为Mock。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use balancer_backend::{BackendApi, ClientFactory};
use balancer_errors::BalancerResult;

pub struct BackendClients {
    factory: Arc<dyn ClientFactory>,
    map: RwLock<HashMap<String, Arc<dyn BackendApi>>>,
}

impl BackendClients {
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            factory,
            map: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, name: &str, base_url: &str) -> BalancerResult<Arc<dyn BackendApi>> {
        let client = self.factory.make(name, base_url)?;
        self.map
            .write()
            .await
            .insert(name.to_string(), client.clone());
        Ok(client)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn BackendApi>> {
        self.map.read().await.get(name).cloned()
    }

    pub async fn remove(&self, name: &str) {
        self.map.write().await.remove(name);
    }
}
