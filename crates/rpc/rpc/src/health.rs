use jsonrpsee::core::server::rpc_module::Methods;
use jsonrpsee::server::middleware::proxy_get_request::ProxyGetRequestLayer;
use jsonrpsee::RpcModule;

/// Simple health check endpoint.
#[derive(Debug)]
pub struct HealthCheck;

impl HealthCheck {
    const METHOD: &'static str = "health";
    const PROXY_PATH: &'static str = "/health";

    pub(crate) fn proxy() -> ProxyGetRequestLayer {
        ProxyGetRequestLayer::new(Self::PROXY_PATH, Self::METHOD).expect("path starts with /")
    }
}

impl From<HealthCheck> for Methods {
    fn from(_: HealthCheck) -> Self {
        let mut module = RpcModule::new(());

        module
            .register_method(HealthCheck::METHOD, |_, _| Ok(serde_json::json!({ "health": true })))
            .expect("health method registration cannot collide");

        module.into()
    }
}
