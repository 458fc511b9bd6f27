use std::collections::HashMap;
use std::sync::Arc;

use taskmesh_core::{
    models::{ProbeProtocol, Worker},
    traits::ExecutionTransport,
};

/// 按Worker声明的协议选择执行传输
pub struct TransportRouter {
    routes: HashMap<ProbeProtocol, Arc<dyn ExecutionTransport>>,
    fallback: Arc<dyn ExecutionTransport>,
}

impl TransportRouter {
    /// 所有协议都走同一个传输
    pub fn new(fallback: Arc<dyn ExecutionTransport>) -> Self {
        Self {
            routes: HashMap::new(),
            fallback,
        }
    }

    pub fn with_route(mut self, protocol: ProbeProtocol, transport: Arc<dyn ExecutionTransport>) -> Self {
        self.routes.insert(protocol, transport);
        self
    }

    pub fn route(&self, worker: &Worker) -> Arc<dyn ExecutionTransport> {
        self.routes
            .get(&worker.transport.protocol)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskmesh_testing_utils::{MockExecutionTransport, WorkerBuilder};

    struct Named(&'static str);

    #[async_trait::async_trait]
    impl ExecutionTransport for Named {
        async fn dispatch(
            &self,
            _worker: &Worker,
            _request: taskmesh_core::traits::DispatchRequest,
        ) -> taskmesh_core::SchedulerResult<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }

        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn test_route_by_protocol_with_fallback() {
        let router = TransportRouter::new(Arc::new(MockExecutionTransport::new()))
            .with_route(ProbeProtocol::Rpc, Arc::new(Named("rpc")));

        let rpc_worker = WorkerBuilder::new().with_protocol(ProbeProtocol::Rpc).build();
        let http_worker = WorkerBuilder::new().with_protocol(ProbeProtocol::Http).build();

        assert_eq!(router.route(&rpc_worker).name(), "rpc");
        assert_eq!(router.route(&http_worker).name(), "mock");
    }
}
