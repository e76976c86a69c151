//! rustls 测试夹具：`rcgen` 现场签发的自签名证书与对应的两端上下文。

use std::sync::Arc;

use rcgen::{CertificateParams, KeyPair};
use rustls::{
    ClientConfig, RootCertStore, ServerConfig,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName},
};
use spark_secure_channel::RustlsContext;

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// 为 `localhost` 签发证书，返回 `(服务端上下文, 信任该证书的客户端上下文)`。
pub fn contexts() -> (RustlsContext, RustlsContext) {
    let params = CertificateParams::new(vec!["localhost".to_string()]).expect("构造证书参数失败");
    let key_pair = KeyPair::generate().expect("生成证书私钥失败");
    let certificate = params.self_signed(&key_pair).expect("签发自签名证书失败");
    let cert_der = CertificateDer::from(certificate.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der()).expect("解析私钥失败");

    let server = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .expect("协议版本")
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key_der)
        .expect("构建服务端配置失败");

    let mut roots = RootCertStore::empty();
    roots.add(cert_der).expect("写入根证书失败");
    let client = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .expect("协议版本")
        .with_root_certificates(roots)
        .with_no_client_auth();

    (
        RustlsContext::server(Arc::new(server)),
        RustlsContext::client(Arc::new(client))
            .with_server_name(ServerName::try_from("localhost").expect("合法主机名")),
    )
}
