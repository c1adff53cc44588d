use super::issuer::Issuer;
use crate::error::{ProxyError, Result};
use crate::tls::{parse_certificates, TlsCertificate};
use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, OrderStatus,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// HTTP-01 挑战请求路径前缀
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

const MAX_POLL_DELAY: Duration = Duration::from_secs(5);

/// 目录别名解析为 URL
///
/// 支持 `letsencrypt`、`letsencrypt-staging` 与任意 https 地址。
pub fn resolve_directory(directory: &str) -> Option<String> {
    match directory.trim() {
        "letsencrypt" => Some(LetsEncrypt::Production.url().to_string()),
        "letsencrypt-staging" => Some(LetsEncrypt::Staging.url().to_string()),
        url if url.starts_with("https://") && url.len() > "https://".len() => {
            Some(url.to_string())
        }
        _ => None,
    }
}

/// HTTP-01 挑战应答表：token -> key authorization
///
/// 签发者在订单进行中写入，HTTP 监听端口据此应答 CA 的验证请求。
#[derive(Debug, Default)]
pub struct Http01Challenges {
    tokens: RwLock<HashMap<String, String>>,
}

impl Http01Challenges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: impl Into<String>, key_authorization: impl Into<String>) {
        self.tokens
            .write()
            .insert(token.into(), key_authorization.into());
    }

    pub fn remove(&self, token: &str) -> Option<String> {
        self.tokens.write().remove(token)
    }

    pub fn response(&self, token: &str) -> Option<String> {
        self.tokens.read().get(token).cloned()
    }

    /// 按请求路径查找应答；路径不是挑战路径时返回 None
    pub fn response_for_path(&self, path: &str) -> Option<String> {
        path.strip_prefix(ACME_CHALLENGE_PREFIX)
            .filter(|token| !token.is_empty())
            .and_then(|token| self.response(token))
    }

    pub fn len(&self) -> usize {
        self.tokens.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.read().is_empty()
    }
}

/// 订单结束（含取消）时撤下已发布的 token
struct PublishedTokens {
    challenges: Arc<Http01Challenges>,
    tokens: Vec<String>,
}

impl PublishedTokens {
    fn new(challenges: Arc<Http01Challenges>) -> Self {
        Self {
            challenges,
            tokens: Vec::new(),
        }
    }

    fn publish(&mut self, token: String, key_authorization: String) {
        self.challenges.insert(token.clone(), key_authorization);
        self.tokens.push(token);
    }
}

impl Drop for PublishedTokens {
    fn drop(&mut self) {
        for token in &self.tokens {
            self.challenges.remove(token);
        }
    }
}

/// ACME 签发配置
#[derive(Debug, Clone)]
pub struct AcmeConfig {
    pub directory_url: String,
    /// 联系邮箱（不含 mailto: 前缀）
    pub contacts: Vec<String>,
    pub account_file: PathBuf,
    pub order_timeout: Duration,
}

/// ACME 证书签发者（HTTP-01）
///
/// 账户在首次签发时注册或从凭据文件恢复，之后复用。
pub struct AcmeIssuer {
    config: AcmeConfig,
    challenges: Arc<Http01Challenges>,
    account: OnceCell<Account>,
}

impl AcmeIssuer {
    pub fn new(config: AcmeConfig, challenges: Arc<Http01Challenges>) -> Self {
        Self {
            config,
            challenges,
            account: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &AcmeConfig {
        &self.config
    }

    pub fn challenges(&self) -> &Arc<Http01Challenges> {
        &self.challenges
    }

    async fn account(&self) -> Result<&Account> {
        self.account
            .get_or_try_init(|| self.load_or_create_account())
            .await
    }

    async fn load_or_create_account(&self) -> Result<Account> {
        let path = &self.config.account_file;

        if let Some(credentials) = read_credentials(path).await? {
            info!("Loaded ACME account from {:?}", path);
            return Account::builder()
                .map_err(acme_error)?
                .from_credentials(credentials)
                .await
                .map_err(acme_error);
        }

        info!("Registering ACME account at {}", self.config.directory_url);
        let contacts: Vec<String> = self
            .config
            .contacts
            .iter()
            .map(|email| format!("mailto:{}", email))
            .collect();
        let contact: Vec<&str> = contacts.iter().map(String::as_str).collect();

        let (account, credentials) = Account::builder()
            .map_err(acme_error)?
            .create(
                &NewAccount {
                    contact: &contact,
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                self.config.directory_url.clone(),
                None,
            )
            .await
            .map_err(acme_error)?;

        // 凭据写入失败时账户仍可用，下次启动会重新注册
        if let Err(e) = write_credentials(path, &credentials).await {
            warn!("Failed to save ACME account to {:?}: {}", path, e);
        }
        Ok(account)
    }

    /// 完成一个订单，返回 (证书链 PEM, 私钥 PEM)
    async fn order(&self, account: &Account, server_name: &str) -> Result<(String, String)> {
        let deadline = Instant::now() + self.config.order_timeout;
        let identifiers = [Identifier::Dns(server_name.to_string())];
        let mut order = account
            .new_order(&NewOrder::new(&identifiers))
            .await
            .map_err(acme_error)?;

        let mut published = PublishedTokens::new(Arc::clone(&self.challenges));
        {
            let mut authorizations = order.authorizations();
            while let Some(result) = authorizations.next().await {
                let mut authz = result.map_err(acme_error)?;
                match &authz.status {
                    AuthorizationStatus::Pending => {}
                    AuthorizationStatus::Valid => continue,
                    status => {
                        return Err(ProxyError::issuance(format!(
                            "authorization for {} is {:?}",
                            server_name, status
                        )))
                    }
                }

                let mut challenge = authz.challenge(ChallengeType::Http01).ok_or_else(|| {
                    ProxyError::issuance(format!("no http-01 challenge offered for {}", server_name))
                })?;
                let key_authorization = challenge.key_authorization().as_str().to_string();
                published.publish(challenge.token.to_string(), key_authorization);
                debug!("Published http-01 token {} for {}", challenge.token, server_name);

                challenge.set_ready().await.map_err(acme_error)?;
            }
        }

        let mut delay = Duration::from_millis(250);
        loop {
            let state = order.refresh().await.map_err(acme_error)?;
            match &state.status {
                OrderStatus::Ready => break,
                OrderStatus::Invalid => {
                    return Err(ProxyError::issuance(format!(
                        "order for {} became invalid",
                        server_name
                    )))
                }
                _ => {}
            }
            wait_or_give_up(deadline, delay, server_name).await?;
            delay = (delay * 2).min(MAX_POLL_DELAY);
        }

        let key_pem = order.finalize().await.map_err(acme_error)?;
        let cert_pem = loop {
            if let Some(chain) = order.certificate().await.map_err(acme_error)? {
                break chain;
            }
            wait_or_give_up(deadline, Duration::from_secs(1), server_name).await?;
        };

        drop(published);
        Ok((cert_pem, key_pem))
    }
}

#[async_trait]
impl Issuer for AcmeIssuer {
    async fn issue(&self, server_name: &str) -> Result<TlsCertificate> {
        let account = self.account().await?;

        info!("Requesting ACME certificate for {}", server_name);
        let (cert_pem, key_pem) = self.order(account, server_name).await?;
        let not_after = certificate_not_after(&cert_pem)?;

        info!("ACME certificate issued for {}", server_name);
        TlsCertificate::from_pem(server_name, cert_pem, key_pem, not_after)
    }
}

async fn wait_or_give_up(deadline: Instant, delay: Duration, server_name: &str) -> Result<()> {
    let now = Instant::now();
    if now >= deadline {
        return Err(ProxyError::issuance(format!(
            "timed out waiting for ACME order for {}",
            server_name
        )));
    }
    tokio::time::sleep(delay.min(deadline - now)).await;
    Ok(())
}

fn acme_error(err: instant_acme::Error) -> ProxyError {
    ProxyError::issuance(format!("ACME: {}", err))
}

/// 读取账户凭据；文件不存在时返回 None
pub async fn read_credentials(path: &Path) -> Result<Option<AccountCredentials>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(ProxyError::issuance(format!(
                "failed to read ACME account {:?}: {}",
                path, e
            )))
        }
    };

    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| ProxyError::issuance(format!("invalid ACME account file {:?}: {}", path, e)))
}

async fn write_credentials(path: &Path, credentials: &AccountCredentials) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(credentials)?;
    tokio::fs::write(path, json).await
}

/// 叶子证书的到期时间
pub fn certificate_not_after(cert_pem: &str) -> Result<SystemTime> {
    let certs = parse_certificates(cert_pem)?;
    let (_, leaf) = x509_parser::parse_x509_certificate(certs[0].as_ref())
        .map_err(|e| ProxyError::tls(format!("Failed to parse certificate: {}", e)))?;

    let timestamp = leaf.validity().not_after.timestamp();
    let secs = u64::try_from(timestamp)
        .map_err(|_| ProxyError::tls(format!("certificate expires before epoch: {}", timestamp)))?;
    Ok(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::generate_self_signed;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "sni-gate-acme-{}-{}-{}",
            std::process::id(),
            rand::random::<u32>(),
            name
        ))
    }

    #[test]
    fn test_resolve_directory() {
        assert_eq!(
            resolve_directory("letsencrypt").as_deref(),
            Some(LetsEncrypt::Production.url())
        );
        assert_eq!(
            resolve_directory("letsencrypt-staging").as_deref(),
            Some(LetsEncrypt::Staging.url())
        );
        assert_eq!(
            resolve_directory("https://ca.internal/directory").as_deref(),
            Some("https://ca.internal/directory")
        );
        assert!(resolve_directory("http://ca.internal/directory").is_none());
        assert!(resolve_directory("https://").is_none());
        assert!(resolve_directory("").is_none());
    }

    #[test]
    fn test_challenge_lookup_by_path() {
        let challenges = Http01Challenges::new();
        challenges.insert("abc", "abc.thumbprint");

        assert_eq!(
            challenges
                .response_for_path("/.well-known/acme-challenge/abc")
                .as_deref(),
            Some("abc.thumbprint")
        );
        assert!(challenges
            .response_for_path("/.well-known/acme-challenge/other")
            .is_none());
        assert!(challenges
            .response_for_path("/.well-known/acme-challenge/")
            .is_none());
        assert!(challenges.response_for_path("/abc").is_none());
    }

    #[test]
    fn test_published_tokens_removed_on_drop() {
        let challenges = Arc::new(Http01Challenges::new());
        challenges.insert("kept", "kept.thumbprint");

        {
            let mut published = PublishedTokens::new(Arc::clone(&challenges));
            published.publish("t1".to_string(), "t1.thumbprint".to_string());
            published.publish("t2".to_string(), "t2.thumbprint".to_string());
            assert_eq!(challenges.len(), 3);
        }

        assert_eq!(challenges.len(), 1);
        assert!(challenges.response("kept").is_some());
    }

    #[test]
    fn test_certificate_not_after() {
        let (cert_pem, _, not_after) =
            generate_self_signed("a.example.com", Duration::from_secs(3600)).unwrap();

        let parsed = certificate_not_after(&cert_pem).unwrap();
        let drift = not_after
            .duration_since(parsed)
            .unwrap_or_else(|e| e.duration());
        assert!(drift < Duration::from_secs(1));

        assert!(certificate_not_after("not a certificate").is_err());
    }

    #[tokio::test]
    async fn test_read_credentials() {
        let missing = temp_path("missing.json");
        assert!(read_credentials(&missing).await.unwrap().is_none());

        let corrupt = temp_path("corrupt.json");
        std::fs::write(&corrupt, "{ not json").unwrap();
        let err = read_credentials(&corrupt).await.err().expect("corrupt credentials must fail");
        assert!(matches!(err, ProxyError::Issuance(_)));
        let _ = std::fs::remove_file(&corrupt);
    }

    #[tokio::test]
    async fn test_unreachable_directory_fails_issuance() {
        let account_file = temp_path("account.json");
        let challenges = Arc::new(Http01Challenges::new());
        let issuer = AcmeIssuer::new(
            AcmeConfig {
                directory_url: "https://127.0.0.1:1/directory".to_string(),
                contacts: vec!["ops@example.com".to_string()],
                account_file: account_file.clone(),
                order_timeout: Duration::from_secs(5),
            },
            Arc::clone(&challenges),
        );

        let err = issuer.issue("a.example.com").await.unwrap_err();
        assert!(matches!(err, ProxyError::Issuance(_)), "unexpected error: {}", err);
        assert!(!account_file.exists());
        assert!(challenges.is_empty());
    }
}
