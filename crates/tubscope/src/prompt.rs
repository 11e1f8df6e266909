//! Terminal credential prompt.

use std::io::{self, BufRead, Write};

use tubscope_core::services::{CredentialPrompt, PromptOutcome, SecretStore};
use tubscope_core::{CredentialKey, TubscopeError, TubscopeResult};

/// Asks for each missing credential on stdin. End of input or a lone `q` cancels.
#[derive(Debug, Default)]
pub struct TerminalPrompt;

impl CredentialPrompt for TerminalPrompt {
    fn collect(
        &self,
        store: &dyn SecretStore,
        service: &str,
        missing: &[CredentialKey],
    ) -> TubscopeResult<PromptOutcome> {
        let stdin = io::stdin();
        let mut input = stdin.lock();
        let mut stdout = io::stdout();

        writeln!(stdout, "Connection details are incomplete (enter q to cancel).")?;

        for key in missing {
            let Some(value) = ask(&mut input, &mut stdout, *key)? else {
                writeln!(stdout, "Cancelled.")?;
                return Ok(PromptOutcome::Cancelled);
            };
            if value.is_empty() {
                continue;
            }
            store.set(service, key.as_str(), &value)?;
        }

        Ok(PromptOutcome::Saved)
    }
}

/// One line for `key`. `None` means cancel.
fn ask(
    input: &mut impl BufRead,
    output: &mut impl Write,
    key: CredentialKey,
) -> TubscopeResult<Option<String>> {
    match key.default_value() {
        Some(default) => write!(output, "{key} [{default}]: ")?,
        None if key.is_secret() => write!(output, "{key} (input is visible): ")?,
        None => write!(output, "{key}: ")?,
    }
    output.flush()?;

    let mut line = String::new();
    let read = input
        .read_line(&mut line)
        .map_err(|e| TubscopeError::internal(format!("Failed to read {key}: {e}")))?;
    if read == 0 {
        return Ok(None);
    }

    let value = line.trim();
    if value == "q" {
        return Ok(None);
    }
    if value.is_empty() {
        return Ok(Some(key.default_value().unwrap_or_default().to_string()));
    }
    Ok(Some(value.to_string()))
}
