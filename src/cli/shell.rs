use std::io::{BufRead, Write};

use anyhow::{Context, Result};

use crate::core::dispatch::SessionHandle;
use crate::core::utils::format_hex;

pub const INTRO: &str = "\
Command shell to communicate with smart card using APDU.
Type APDU as a hex string.
Use 'exit' command to leave shell.
Use 'atr' command to print card's ATR.
";

/// Output switches for the shell loop
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellOptions {
    /// Print the exchange duration after each command
    pub show_timing: bool,
}

/// Read-eval loop: one operator line per iteration until `exit` or end of input.
///
/// Traffic produced by commands is traced by the session's tracer; this
/// loop only prints prompts, built-in command output and errors.
pub fn run_shell<R: BufRead, W: Write>(
    session: &SessionHandle,
    input: R,
    out: &mut W,
    options: ShellOptions,
) -> Result<()> {
    writeln!(out, "{INTRO}")?;

    let mut lines = input.lines();
    loop {
        write!(out, "{}", session.snapshot()?.prompt())?;
        out.flush()?;

        let Some(line) = lines.next() else {
            writeln!(out)?;
            break;
        };
        let line = line.context("Failed to read input")?;

        match line.trim() {
            "exit" => break,
            // The card may have changed while the line was typed
            "atr" => match session.snapshot()?.atr {
                Some(atr) => writeln!(out, "{}", format_hex(&atr))?,
                None => writeln!(out, "Error: Card connection not found")?,
            },
            "help" => {
                writeln!(out, "Available commands:")?;
                writeln!(out, "  <hex APDU>  - Send APDU to the card (e.g. 00A4040007A0000002471001)")?;
                writeln!(out, "  atr         - Print the card's ATR")?;
                writeln!(out, "  help        - Show this help")?;
                writeln!(out, "  exit        - Leave the shell")?;
            }
            apdu => match session.submit(apdu) {
                Ok(Some(result)) if options.show_timing => {
                    writeln!(
                        out,
                        "Duration: {}ms ({} bytes received)",
                        result.duration_ms,
                        result.response.len()
                    )?;
                }
                Ok(_) => {}
                Err(e) => {
                    log::debug!("Command failed: {e:?}");
                    writeln!(out, "{}", e.user_message())?;
                }
            },
        }
    }

    writeln!(out, "Bye!")?;
    Ok(())
}
