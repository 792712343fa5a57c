use anyhow::{Context, Result, bail};
use pagecrypt::Secret;
use std::io::{self, BufRead, IsTerminal};
use zeroize::Zeroizing;

pub const PASSPHRASE_ENV: &str = "PAGECRYPT_PASSPHRASE";
pub const NEW_PASSPHRASE_ENV: &str = "PAGECRYPT_NEW_PASSPHRASE";
pub const RAW_KEY_ENV: &str = "PAGECRYPT_RAW_KEY";
pub const NEW_RAW_KEY_ENV: &str = "PAGECRYPT_NEW_RAW_KEY";

/// Key for an existing database: raw key from the environment, otherwise a
/// passphrase.
pub fn read_secret() -> Result<Secret> {
    if let Some(secret) = raw_key_from_env(RAW_KEY_ENV)? {
        return Ok(secret);
    }
    Ok(Secret::Passphrase(read_passphrase()?))
}

/// Key for a database being created or rekeyed. Passphrases typed at a
/// terminal are asked for twice.
pub fn read_new_secret(raw_env: &str, passphrase_env: &str) -> Result<Secret> {
    if let Some(secret) = raw_key_from_env(raw_env)? {
        return Ok(secret);
    }
    if let Some(pw) = passphrase_from_env(passphrase_env) {
        return Ok(Secret::Passphrase(pw));
    }
    Ok(Secret::Passphrase(read_new_passphrase()?))
}

fn raw_key_from_env(name: &str) -> Result<Option<Secret>> {
    match std::env::var(name) {
        Ok(hex_key) if !hex_key.is_empty() => {
            let secret = Secret::from_hex(&hex_key).with_context(|| format!("invalid {name}"))?;
            Ok(Some(secret))
        }
        _ => Ok(None),
    }
}

fn passphrase_from_env(name: &str) -> Option<Zeroizing<String>> {
    match std::env::var(name) {
        Ok(pw) if !pw.is_empty() => Some(Zeroizing::new(pw)),
        _ => None,
    }
}

/// Passphrase for an existing database: `PAGECRYPT_PASSPHRASE`, else one
/// line of piped stdin, else a hidden terminal prompt.
pub fn read_passphrase() -> Result<Zeroizing<String>> {
    if let Some(pw) = passphrase_from_env(PASSPHRASE_ENV) {
        return Ok(pw);
    }
    prompt("Passphrase: ")?.context("no passphrase provided")
}

/// New passphrase, entered twice. Piped stdin supplies both lines.
fn read_new_passphrase() -> Result<Zeroizing<String>> {
    let first = prompt("New passphrase: ")?.context("passphrase cannot be empty")?;
    let second = prompt("Confirm passphrase: ")?.unwrap_or_else(|| Zeroizing::new(String::new()));
    if first != second {
        bail!("passphrases do not match");
    }
    Ok(first)
}

/// One line from stdin, or a hidden prompt when stdin is a terminal.
/// `None` for an empty answer.
fn prompt(label: &str) -> Result<Option<Zeroizing<String>>> {
    let stdin = io::stdin();
    let mut line = if stdin.is_terminal() {
        Zeroizing::new(rpassword::prompt_password(label)?)
    } else {
        let mut buf = Zeroizing::new(String::new());
        stdin.lock().read_line(&mut buf)?;
        buf
    };

    let len = line.trim_end_matches(['\r', '\n']).len();
    line.truncate(len);
    Ok((!line.is_empty()).then_some(line))
}
