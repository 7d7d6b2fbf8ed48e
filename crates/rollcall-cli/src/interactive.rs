//! Interactive camera session and human-readable outcome lines.

use anyhow::Result;
use rollcall_core::ledger::LedgerError;
use rollcall_core::{AttendanceOutcome, FaceEmbedder, FaceLocator, Session, SessionError};
use rollcall_hw::FrameSource;
use std::io::{BufRead, Write};
use std::path::Path;

const HELP: &str = "\
commands:
  <enter> | c        capture a frame and mark attendance
  k <n>              set neighbors consulted
  threshold <x>      set the distance threshold
  status             show parameters and attendance
  save               export attendance now
  q | quit           export (if anything changed) and exit";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Capture,
    SetK(usize),
    SetThreshold(f32),
    Status,
    Save,
    Help,
    Quit,
}

/// Parse one line of user input.
pub fn parse_command(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Ok(Command::Capture);
    };
    let arg = words.next();
    if words.next().is_some() {
        return Err(format!("too many arguments: {line:?}"));
    }

    match (head.to_ascii_lowercase().as_str(), arg) {
        ("c" | "capture", None) => Ok(Command::Capture),
        ("k", Some(n)) => n
            .parse()
            .map(Command::SetK)
            .map_err(|_| format!("not a whole number: {n:?}")),
        ("t" | "threshold", Some(x)) => x
            .parse()
            .map(Command::SetThreshold)
            .map_err(|_| format!("not a number: {x:?}")),
        ("status", None) => Ok(Command::Status),
        ("save", None) => Ok(Command::Save),
        ("help" | "?", None) => Ok(Command::Help),
        ("q" | "quit" | "exit", None) => Ok(Command::Quit),
        _ => Err(format!("unrecognized command: {line:?} (try 'help')")),
    }
}

/// One status line for a classification outcome.
pub fn describe(outcome: &AttendanceOutcome) -> String {
    match outcome {
        AttendanceOutcome::Marked {
            identity_id,
            display_name,
            newly_marked,
            decision,
        } => {
            let prefix = if *newly_marked { "present" } else { "already present" };
            format!(
                "{prefix}: {display_name} ({identity_id}), {}/{} votes, mean distance {:.3}",
                decision.majority_count, decision.k, decision.confidence_distance
            )
        }
        AttendanceOutcome::UnknownMatch { decision } => format!(
            "unknown face (closest distance {:.3}, best guess {} with {}/{} votes)",
            decision.closest_distance, decision.majority_label, decision.majority_count, decision.k
        ),
        AttendanceOutcome::NoFaceDetected => "no face detected, try again".to_string(),
    }
}

/// Run one classification and print its status line.
///
/// Roster inconsistencies and per-image face processing failures are
/// reported but do not end the session. Returns true when someone was newly
/// marked present.
pub fn report<L, E>(
    session: &mut Session,
    image: &image::RgbImage,
    locator: &mut L,
    embedder: &mut E,
) -> Result<bool>
where
    L: FaceLocator + ?Sized,
    E: FaceEmbedder + ?Sized,
{
    match session.identify(image, locator, embedder) {
        Ok(outcome) => {
            println!("{}", describe(&outcome));
            Ok(matches!(outcome, AttendanceOutcome::Marked { newly_marked: true, .. }))
        }
        Err(SessionError::Ledger(LedgerError::UnknownIdentity(id))) => {
            tracing::error!(
                identity = %id,
                "matched identity is not on the roster; re-enroll against the current roster"
            );
            println!("matched {id}, but {id} is not on the roster");
            Ok(false)
        }
        Err(SessionError::Pipeline(e)) => {
            tracing::warn!(error = %e, "face processing failed");
            println!("face processing failed: {e}");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// Read commands from `input` until quit or EOF.
pub fn run<S, L, E>(
    session: &mut Session,
    camera: &mut S,
    locator: &mut L,
    embedder: &mut E,
    export_dir: &Path,
    input: impl BufRead,
) -> Result<()>
where
    S: FrameSource + ?Sized,
    L: FaceLocator + ?Sized,
    E: FaceEmbedder + ?Sized,
{
    let mut dirty = false;
    println!("{HELP}");
    prompt();

    for line in input.lines() {
        let line = line?;
        match parse_command(&line) {
            Ok(Command::Capture) => match camera.acquire_frame() {
                Ok(frame) => match report(session, &frame, locator, embedder) {
                    Ok(marked) => dirty |= marked,
                    Err(e) => {
                        if dirty {
                            export(session, export_dir)?;
                        }
                        return Err(e);
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, "capture failed");
                    println!("capture failed: {e}");
                }
            },
            Ok(Command::SetK(k)) => match session.set_k(k) {
                Ok(effective) => println!("k = {effective}"),
                Err(e) => println!("{e}"),
            },
            Ok(Command::SetThreshold(t)) => match session.set_threshold(t) {
                Ok(()) => println!("threshold = {t}"),
                Err(e) => println!("{e}"),
            },
            Ok(Command::Status) => print_status(session),
            Ok(Command::Save) => {
                export(session, export_dir)?;
                dirty = false;
            }
            Ok(Command::Help) => println!("{HELP}"),
            Ok(Command::Quit) => break,
            Err(msg) => println!("{msg}"),
        }
        prompt();
    }

    if dirty {
        export(session, export_dir)?;
    }
    Ok(())
}

pub fn export(session: &Session, export_dir: &Path) -> Result<()> {
    let now = chrono::Local::now().naive_local();
    let path = session.roster().export_timestamped(export_dir, now)?;
    println!(
        "attendance written to {} ({}/{} present)",
        path.display(),
        session.roster().present_count(),
        session.roster().len()
    );
    Ok(())
}

fn print_status(session: &Session) {
    let params = session.params();
    println!(
        "k = {}, threshold = {}, {} records enrolled",
        params.k,
        params.threshold,
        session.database().len()
    );
    for entry in session.roster().entries() {
        println!("  {:<8} {:<12} {}", entry.status, entry.identity_id, entry.display_name);
    }
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}
