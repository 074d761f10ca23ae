//! Root CA persistence and on-demand leaf minting for TLS interception.
//!
//! The root key never leaves process memory once loaded. Both bootstrap and
//! minting run under one lock, so a leaf is generated at most once per host
//! per process lifetime (re-minted only after its lifetime cap expires).

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use parking_lot::Mutex;
use rcgen::{
	BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
	Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::info;

const ROOT_CERT_FILE: &str = "cert.pem";
const ROOT_KEY_FILE: &str = "key.pem";
const ROOT_VALIDITY_DAYS: i64 = 3650;
const BACKDATE: time::Duration = time::Duration::hours(1);
const LEAF_VALIDITY: time::Duration = time::Duration::hours(24);

pub struct Root {
	issuer: Issuer<'static, KeyPair>,
	pub cert_pem: String,
	pub cert_der: CertificateDer<'static>,
}

struct CachedLeaf {
	config: Arc<rustls::ServerConfig>,
	minted_at: Instant,
}

struct Inner {
	root: Option<Arc<Root>>,
	leaves: HashMap<String, CachedLeaf>,
}

pub struct CaStore {
	dir: PathBuf,
	leaf_ttl: Duration,
	inner: Mutex<Inner>,
}

impl CaStore {
	pub fn new(dir: PathBuf) -> CaStore {
		CaStore {
			dir,
			leaf_ttl: Duration::from_secs(24 * 60 * 60),
			inner: Mutex::new(Inner {
				root: None,
				leaves: HashMap::new(),
			}),
		}
	}

	pub fn cert_path(&self) -> PathBuf {
		self.dir.join(ROOT_CERT_FILE)
	}

	pub fn key_path(&self) -> PathBuf {
		self.dir.join(ROOT_KEY_FILE)
	}

	/// Load the root from disk, or generate and persist a fresh one.
	pub fn ensure_root(&self) -> anyhow::Result<()> {
		let mut inner = self.inner.lock();
		self.ensure_root_locked(&mut inner).map(|_| ())
	}

	pub fn root_cert_pem(&self) -> anyhow::Result<String> {
		let mut inner = self.inner.lock();
		let root = self.ensure_root_locked(&mut inner)?;
		Ok(root.cert_pem.clone())
	}

	pub fn root_cert_der(&self) -> anyhow::Result<CertificateDer<'static>> {
		let mut inner = self.inner.lock();
		let root = self.ensure_root_locked(&mut inner)?;
		Ok(root.cert_der.clone())
	}

	fn ensure_root_locked(&self, inner: &mut Inner) -> anyhow::Result<Arc<Root>> {
		if let Some(root) = &inner.root {
			return Ok(root.clone());
		}
		let cert_path = self.cert_path();
		let key_path = self.key_path();
		let root = if cert_path.exists() && key_path.exists() {
			load_root(&cert_path, &key_path)?
		} else {
			let (root, key_pem) = generate_root()?;
			create_private_dir(&self.dir)?;
			write_with_mode(&key_path, key_pem.as_bytes(), 0o600)?;
			write_with_mode(&cert_path, root.cert_pem.as_bytes(), 0o644)?;
			info!(cert = %cert_path.display(), "generated root CA");
			root
		};
		let root = Arc::new(root);
		inner.root = Some(root.clone());
		Ok(root)
	}

	/// Return a rustls server config for `host`, minting and caching a leaf
	/// if needed. Two calls for one host return the same certificate.
	pub fn leaf(&self, host: &str) -> anyhow::Result<Arc<rustls::ServerConfig>> {
		let host = host.to_ascii_lowercase();
		let mut inner = self.inner.lock();
		if let Some(cached) = inner.leaves.get(&host)
			&& cached.minted_at.elapsed() < self.leaf_ttl
		{
			return Ok(cached.config.clone());
		}
		let root = self.ensure_root_locked(&mut inner)?;
		let config = mint_leaf(&root, &host)?;
		inner.leaves.insert(
			host,
			CachedLeaf {
				config: config.clone(),
				minted_at: Instant::now(),
			},
		);
		Ok(config)
	}
}

fn random_serial() -> SerialNumber {
	// 128-bit, top bit cleared so the DER integer stays positive.
	let serial = rand::random::<u128>() & !(1u128 << 127);
	SerialNumber::from(serial.to_be_bytes().to_vec())
}

fn generate_root() -> anyhow::Result<(Root, String)> {
	let key = KeyPair::generate().context("failed to generate root key")?;

	let mut params = CertificateParams::default();
	params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
	params.key_usages = vec![
		KeyUsagePurpose::KeyCertSign,
		KeyUsagePurpose::CrlSign,
		KeyUsagePurpose::DigitalSignature,
	];
	let mut dn = DistinguishedName::new();
	dn.push(DnType::CommonName, "cloakproxy root CA");
	params.distinguished_name = dn;
	params.serial_number = Some(random_serial());
	let now = time::OffsetDateTime::now_utc();
	params.not_before = now - BACKDATE;
	params.not_after = params.not_before + time::Duration::days(ROOT_VALIDITY_DAYS);

	let cert = params
		.self_signed(&key)
		.context("failed to self-sign root")?;
	let cert_pem = cert.pem();
	let cert_der = cert.der().clone();
	let key_pem = key.serialize_pem();
	let issuer = Issuer::from_ca_cert_pem(&cert_pem, key).context("failed to build issuer")?;

	Ok((
		Root {
			issuer,
			cert_pem,
			cert_der,
		},
		key_pem,
	))
}

fn load_root(cert_path: &Path, key_path: &Path) -> anyhow::Result<Root> {
	let cert_pem = std::fs::read_to_string(cert_path)
		.with_context(|| format!("failed to read {}", cert_path.display()))?;
	let key_pem = std::fs::read_to_string(key_path)
		.with_context(|| format!("failed to read {}", key_path.display()))?;
	let key = KeyPair::from_pem(&key_pem).context("failed to parse root key")?;
	let issuer = Issuer::from_ca_cert_pem(&cert_pem, key).context("failed to parse root cert")?;
	let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
		.next()
		.context("no certificate in root PEM")?
		.context("failed to decode root PEM")?;
	Ok(Root {
		issuer,
		cert_pem,
		cert_der,
	})
}

fn mint_leaf(root: &Root, host: &str) -> anyhow::Result<Arc<rustls::ServerConfig>> {
	let mut params = if let Ok(ip) = host.parse::<IpAddr>() {
		let mut p = CertificateParams::new(Vec::new()).context("failed to build leaf params")?;
		p.subject_alt_names.push(SanType::IpAddress(ip));
		p
	} else {
		CertificateParams::new(vec![host.to_string()]).context("failed to build leaf params")?
	};

	let mut dn = DistinguishedName::new();
	dn.push(DnType::CommonName, host);
	params.distinguished_name = dn;
	params.serial_number = Some(random_serial());
	params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
	params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
	let now = time::OffsetDateTime::now_utc();
	params.not_before = now - BACKDATE;
	params.not_after = params.not_before + LEAF_VALIDITY;

	let key = KeyPair::generate().context("failed to generate leaf key")?;
	let cert = params
		.signed_by(&key, &root.issuer)
		.with_context(|| format!("failed to sign leaf for {host}"))?;

	let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));
	let mut config = rustls::ServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(vec![cert.der().clone()], key_der)
		.context("failed to build server config")?;
	config.alpn_protocols = vec![b"http/1.1".to_vec()];
	Ok(Arc::new(config))
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> anyhow::Result<()> {
	use std::os::unix::fs::DirBuilderExt;
	if dir.exists() {
		return Ok(());
	}
	std::fs::DirBuilder::new()
		.recursive(true)
		.mode(0o700)
		.create(dir)
		.with_context(|| format!("failed to create {}", dir.display()))
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> anyhow::Result<()> {
	std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))
}

#[cfg(unix)]
fn write_with_mode(path: &Path, contents: &[u8], mode: u32) -> anyhow::Result<()> {
	use std::io::Write;
	use std::os::unix::fs::OpenOptionsExt;
	let mut f = std::fs::OpenOptions::new()
		.write(true)
		.create(true)
		.truncate(true)
		.mode(mode)
		.open(path)
		.with_context(|| format!("failed to create {}", path.display()))?;
	f.write_all(contents)
		.with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(not(unix))]
fn write_with_mode(path: &Path, contents: &[u8], _mode: u32) -> anyhow::Result<()> {
	std::fs::write(path, contents).with_context(|| format!("failed to write {}", path.display()))
}
