//! 单元测试用的进程内 Provider 模拟服务。

use axum::Router;
use tokio::task::JoinHandle;

/**
 * \brief 绑定 127.0.0.1 随机端口的 axum 服务，drop 时终止。
 */
pub struct MockProvider {
    addr: std::net::SocketAddr,
    handle: JoinHandle<()>,
}

impl MockProvider {
    pub async fn start(router: Router) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock provider");
        let addr = listener.local_addr().expect("mock provider addr");
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        Self { addr, handle }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl Drop for MockProvider {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
