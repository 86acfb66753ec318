//! Callforge Admin CLI
//!
//! Secure provisioning tool for running Callforge orchestrator instances: delivers the
//! STT/LLM/TTS/embeddings provider API keys and the at-rest credential master key (§1a,
//! §6a) over a signed, end-to-end-encrypted bootstrap handshake, so those secrets never
//! need to sit in a plain environment variable or config file on the host.
//!
//! Commands:
//! - keygen: generate an admin Ed25519 keypair
//! - provision: send encrypted secrets to a running orchestrator
//! - status: check an orchestrator's provisioning status
//! - pubkey: print the public key for a private key file

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use clap::{Parser, Subcommand};
use colored::Colorize;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};
use zeroize::Zeroize;

#[derive(Parser)]
#[command(name = "callforge-admin")]
#[command(about = "Secure provisioning tool for Callforge", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new admin Ed25519 keypair
    Keygen {
        /// Output directory for keys
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },
    /// Provision secrets to a running Callforge orchestrator
    Provision {
        /// Orchestrator's admin endpoint URL (e.g., http://localhost:9999)
        #[arg(short, long)]
        instance_url: String,
        /// Path to admin private key file
        #[arg(short, long)]
        admin_key: PathBuf,
        /// Streaming STT provider API key
        #[arg(long)]
        stt_api_key: String,
        /// Chat LLM provider API key
        #[arg(long)]
        llm_api_key: String,
        /// Streaming TTS provider API key
        #[arg(long)]
        tts_api_key: String,
        /// Embeddings provider API key (optional; omit if the knowledge base is unused)
        #[arg(long)]
        embeddings_api_key: Option<String>,
        /// Base64-encoded 32-byte AES-256-GCM key used to encrypt per-Phone provider
        /// credentials at rest
        #[arg(long)]
        at_rest_key: String,
    },
    /// Check orchestrator provisioning status
    Status {
        /// Orchestrator's admin endpoint URL
        #[arg(short, long)]
        instance_url: String,
    },
    /// Display the public key from a private key file
    Pubkey {
        /// Path to admin private key file
        #[arg(short, long)]
        admin_key: PathBuf,
    },
}

/// Secrets payload sent to the orchestrator. Field shape mirrors
/// `callforge::admin::secrets::SecretsPayload` on the receiving end.
#[derive(Serialize)]
struct SecretsPayload {
    stt_api_key: String,
    llm_api_key: String,
    tts_api_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    embeddings_api_key: Option<String>,
    at_rest_key_b64: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    custom: HashMap<String, String>,
}

impl Drop for SecretsPayload {
    fn drop(&mut self) {
        self.stt_api_key.zeroize();
        self.llm_api_key.zeroize();
        self.tts_api_key.zeroize();
        if let Some(ref mut key) = self.embeddings_api_key {
            key.zeroize();
        }
        self.at_rest_key_b64.zeroize();
        for value in self.custom.values_mut() {
            value.zeroize();
        }
        self.custom.clear();
    }
}

/// Provision request to orchestrator
#[derive(Serialize)]
struct ProvisionRequest {
    admin_x25519_public: String,
    ciphertext: String,
    nonce: String,
    signature: String,
}

/// Orchestrator public key response
#[derive(Deserialize)]
struct PublicKeyResponse {
    public_key: String,
}

/// Orchestrator status response
#[derive(Deserialize)]
struct StatusResponse {
    status: String,
}

/// Provision response
#[derive(Deserialize)]
struct ProvisionResponse {
    success: bool,
    message: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen { output } => cmd_keygen(output).await,
        Commands::Provision {
            instance_url,
            admin_key,
            stt_api_key,
            llm_api_key,
            tts_api_key,
            embeddings_api_key,
            at_rest_key,
        } => cmd_provision(instance_url, admin_key, stt_api_key, llm_api_key, tts_api_key, embeddings_api_key, at_rest_key).await,
        Commands::Status { instance_url } => cmd_status(instance_url).await,
        Commands::Pubkey { admin_key } => cmd_pubkey(admin_key).await,
    }
}

/// Generate admin keypair
async fn cmd_keygen(output: PathBuf) -> Result<()> {
    println!("{}", "Generating Ed25519 admin keypair...".cyan());

    let signing_key = SigningKey::generate(&mut OsRng);
    let verifying_key = signing_key.verifying_key();

    let private_key_bytes = signing_key.to_bytes();
    let public_key_base64 = BASE64.encode(verifying_key.to_bytes());

    fs::create_dir_all(&output).context("failed to create output directory")?;

    let private_key_path = output.join("admin.key");
    fs::write(&private_key_path, private_key_bytes).context("failed to write private key")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&private_key_path)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(&private_key_path, perms)?;
    }

    let public_key_path = output.join("admin.pub");
    fs::write(&public_key_path, &public_key_base64).context("failed to write public key")?;

    println!();
    println!("{}", "Keys generated successfully!".green().bold());
    println!();
    println!("Private key: {}", private_key_path.display().to_string().yellow());
    println!("  {} Keep this file secure! Never share it.", "WARNING:".red().bold());
    println!();
    println!("Public key:  {}", public_key_path.display().to_string().yellow());
    println!();
    println!("{}", "Add this to the orchestrator's config (admin.public_key):".cyan());
    println!("  {}", public_key_base64.green());
    println!();

    Ok(())
}

/// Provision secrets to the orchestrator
#[allow(clippy::too_many_arguments)]
async fn cmd_provision(
    instance_url: String,
    admin_key_path: PathBuf,
    stt_api_key: String,
    llm_api_key: String,
    tts_api_key: String,
    embeddings_api_key: Option<String>,
    at_rest_key: String,
) -> Result<()> {
    println!("{}", "Provisioning secrets to orchestrator...".cyan());

    let private_key_bytes = fs::read(&admin_key_path).context("failed to read admin private key")?;
    if private_key_bytes.len() != 32 {
        anyhow::bail!("invalid private key file - expected 32 bytes");
    }
    let mut key_array = [0u8; 32];
    key_array.copy_from_slice(&private_key_bytes);
    let admin_signing_key = SigningKey::from_bytes(&key_array);
    key_array.zeroize();

    let client = reqwest::Client::new();
    let pubkey_url = format!("{}/pubkey", instance_url.trim_end_matches('/'));
    println!("  Fetching orchestrator public key from {pubkey_url}...");

    let response = client.get(&pubkey_url).send().await.context("failed to connect to orchestrator")?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("orchestrator returned error {status}: {body}");
    }

    let pubkey_response: PublicKeyResponse = response.json().await.context("failed to parse public key response")?;

    let instance_x25519_public_bytes = BASE64.decode(&pubkey_response.public_key).context("invalid orchestrator public key encoding")?;
    if instance_x25519_public_bytes.len() != 32 {
        anyhow::bail!("invalid orchestrator public key length");
    }
    let mut instance_key_array = [0u8; 32];
    instance_key_array.copy_from_slice(&instance_x25519_public_bytes);
    let instance_x25519_public = X25519PublicKey::from(instance_key_array);

    println!("  {}", "Orchestrator public key received".green());

    let admin_x25519_secret = EphemeralSecret::random_from_rng(OsRng);
    let admin_x25519_public = X25519PublicKey::from(&admin_x25519_secret);
    let shared_secret = admin_x25519_secret.diffie_hellman(&instance_x25519_public);

    let secrets = SecretsPayload {
        stt_api_key,
        llm_api_key,
        tts_api_key,
        embeddings_api_key,
        at_rest_key_b64: at_rest_key,
        custom: HashMap::new(),
    };
    let plaintext = serde_json::to_vec(&secrets).context("failed to serialize secrets")?;

    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let cipher = ChaCha20Poly1305::new_from_slice(shared_secret.as_bytes()).context("failed to create cipher")?;
    let ciphertext = cipher.encrypt(nonce, plaintext.as_ref()).map_err(|_| anyhow::anyhow!("encryption failed"))?;

    println!("  {}", "Secrets encrypted".green());

    let mut message = Vec::new();
    message.extend_from_slice(admin_x25519_public.as_bytes());
    message.extend_from_slice(&ciphertext);
    message.extend_from_slice(&nonce_bytes);
    let signature = admin_signing_key.sign(&message);

    println!("  {}", "Request signed".green());

    let request = ProvisionRequest {
        admin_x25519_public: BASE64.encode(admin_x25519_public.as_bytes()),
        ciphertext: BASE64.encode(&ciphertext),
        nonce: BASE64.encode(nonce_bytes),
        signature: BASE64.encode(signature.to_bytes()),
    };

    let provision_url = format!("{}/provision", instance_url.trim_end_matches('/'));
    println!("  Sending provision request to {provision_url}...");

    let response = client.post(&provision_url).json(&request).send().await.context("failed to send provision request")?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("provisioning failed with status {status}: {body}");
    }

    let provision_response: ProvisionResponse = response.json().await.context("failed to parse provision response")?;

    if provision_response.success {
        println!();
        println!("{}", "Provisioning successful!".green().bold());
        if let Some(msg) = provision_response.message {
            println!("  {msg}");
        }
    } else {
        anyhow::bail!("provisioning failed: {:?}", provision_response.message);
    }

    Ok(())
}

/// Check orchestrator status
async fn cmd_status(instance_url: String) -> Result<()> {
    println!("{}", "Checking orchestrator status...".cyan());

    let client = reqwest::Client::new();
    let status_url = format!("{}/status", instance_url.trim_end_matches('/'));

    let response = client.get(&status_url).send().await.context("failed to connect to orchestrator")?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("orchestrator returned error {status}: {body}");
    }

    let status_response: StatusResponse = response.json().await.context("failed to parse status response")?;

    println!();
    match status_response.status.as_str() {
        "waiting_for_provisioning" => {
            println!("Orchestrator status: {}", "Waiting for provisioning".yellow());
            println!("Run `callforge-admin provision` to configure it.");
        }
        "provisioned" => {
            println!("Orchestrator status: {}", "Provisioned".green());
        }
        other => {
            println!("Orchestrator status: {other}");
        }
    }

    Ok(())
}

/// Display public key from private key file
async fn cmd_pubkey(admin_key_path: PathBuf) -> Result<()> {
    let private_key_bytes = fs::read(&admin_key_path).context("failed to read admin private key")?;
    if private_key_bytes.len() != 32 {
        anyhow::bail!("invalid private key file - expected 32 bytes");
    }
    let mut key_array = [0u8; 32];
    key_array.copy_from_slice(&private_key_bytes);
    let signing_key = SigningKey::from_bytes(&key_array);
    key_array.zeroize();

    let verifying_key: VerifyingKey = signing_key.verifying_key();
    let public_key_base64 = BASE64.encode(verifying_key.to_bytes());

    println!("{}", "Admin Public Key (base64):".cyan());
    println!("{}", public_key_base64.green());
    println!();
    println!("Add this to the orchestrator's config file:");
    println!("  [admin]");
    println!("  public_key = \"{public_key_base64}\"");

    Ok(())
}
