//! Slash command parsing and execution.
//!
//! The first whitespace-separated token of a COMMAND payload is matched
//! exactly against a static opcode table; the rest are arguments.

use crate::handler::SessionError;
use crate::protocol::{message, MAX_FRAME_PAYLOAD};
use crate::registry::PairError;
use crate::relay;
use crate::session::clamp_name;
use crate::state::ChatState;
use crate::uid::Uid;
use tracing::debug;

/// Command opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Help,
    Private,
    Common,
    List,
    UserName,
    RoomName,
    Quit,
}

const OPCODES: [(&str, Opcode); 7] = [
    ("/help", Opcode::Help),
    ("/msg", Opcode::Private),
    ("/com", Opcode::Common),
    ("/list", Opcode::List),
    ("/uname", Opcode::UserName),
    ("/rname", Opcode::RoomName),
    ("/quit", Opcode::Quit),
];

const HELP_TEXT: &str = "\r\n\
/quit            Quit chatroom\r\n\
/rname <text>    Set chat room name\r\n\
/uname <name>    Change username\r\n\
/msg <peer uid>  Enter private mode\r\n\
/com             Enter public mode\r\n\
/list            Show active clients\r\n\
/help            Show help\r\n";

/// Parsed command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Quit,
    /// `/rname <text...>`
    RoomName(Vec<String>),
    /// `/uname <name>`
    UserName(Option<String>),
    /// `/msg <uid>`
    Private(Option<String>),
    Common,
    List,
    Help,
    Unknown(String),
}

impl Command {
    pub fn parse(text: &str) -> Command {
        let mut tokens = text.split_whitespace();
        let Some(head) = tokens.next() else {
            return Command::Unknown(String::new());
        };

        let opcode = OPCODES
            .iter()
            .find(|(name, _)| *name == head)
            .map(|&(_, op)| op);

        match opcode {
            Some(Opcode::Quit) => Command::Quit,
            Some(Opcode::RoomName) => Command::RoomName(tokens.map(str::to_string).collect()),
            Some(Opcode::UserName) => Command::UserName(tokens.next().map(str::to_string)),
            Some(Opcode::Private) => Command::Private(tokens.next().map(str::to_string)),
            Some(Opcode::Common) => Command::Common,
            Some(Opcode::List) => Command::List,
            Some(Opcode::Help) => Command::Help,
            None => Command::Unknown(head.to_string()),
        }
    }
}

/// What the connection loop does after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Keep reading frames.
    Continue,
    /// Begin teardown.
    Quit,
    /// Bad arguments; the caller has been told and nothing was relayed.
    Failed,
}

/// Execute `command` on behalf of session `uid`.
///
/// Errors are failures of the caller's own connection and end its session.
pub async fn dispatch(state: &ChatState, uid: Uid, command: Command) -> Result<Outcome, SessionError> {
    debug!(uid, ?command, "Dispatching command");

    match command {
        Command::Quit => Ok(Outcome::Quit),

        Command::RoomName(words) => {
            if words.is_empty() {
                return fail(state, uid, "message cannot be null\r\n").await;
            }
            let topic = state.room.set(&words.join(" ")).await;
            relay::broadcast(
                &state.registry,
                &message(&format!("topic changed to: {topic}\r\n"))?,
            )
            .await;
            Ok(Outcome::Continue)
        }

        Command::UserName(name) => {
            let Some(name) = name else {
                return fail(state, uid, "name cannot be null\r\n").await;
            };
            let name = clamp_name(&name);
            let old = state
                .registry
                .rename(uid, name.clone())
                .await
                .ok_or(relay::RelayError::Unreachable(uid))?;
            relay::broadcast(
                &state.registry,
                &message(&format!("{old} is now known as {name}\r\n"))?,
            )
            .await;
            Ok(Outcome::Continue)
        }

        Command::Private(arg) => {
            let Some(arg) = arg else {
                return fail(state, uid, "reference cannot be null\r\n").await;
            };
            let Ok(peer) = arg.parse::<Uid>() else {
                return fail(state, uid, &format!("invalid uid: {arg}\r\n")).await;
            };
            start_private(state, uid, peer).await
        }

        Command::Common => {
            let mut roster = state.registry.lock().await;
            let Some(unpaired) = roster.unpair(uid) else {
                drop(roster);
                return fail(state, uid, "not in a private talk\r\n").await;
            };
            let notice = message("end private talk!\r\n")?;
            relay::deliver(&mut roster, &notice, uid).await?;
            if unpaired.peer_released {
                relay::unicast_in(&mut roster, &notice, unpaired.former_peer).await;
            }
            Ok(Outcome::Continue)
        }

        Command::List => {
            let mut roster = state.registry.lock().await;
            let mut lines = vec![format!("your id: {uid}\r\nclient num: {}\r\n", roster.len())];
            lines.extend(
                roster
                    .iter()
                    .map(|s| format!("uid: [{}] name:{}\r\n", s.uid, s.name)),
            );
            for chunk in pack_lines(&lines, MAX_FRAME_PAYLOAD) {
                relay::deliver(&mut roster, &message(&chunk)?, uid).await?;
            }
            Ok(Outcome::Continue)
        }

        Command::Help => {
            relay::reply(&state.registry, &message(HELP_TEXT)?, uid).await?;
            Ok(Outcome::Continue)
        }

        Command::Unknown(_) => {
            relay::reply(&state.registry, &message("unknown command\r\n")?, uid).await?;
            Ok(Outcome::Continue)
        }
    }
}

async fn start_private(state: &ChatState, uid: Uid, peer: Uid) -> Result<Outcome, SessionError> {
    let mut roster = state.registry.lock().await;
    let paired = roster.pair(uid, peer);
    let displaced = match paired {
        Ok(displaced) => displaced,
        Err(PairError::SelfPair | PairError::UnknownSession(_)) => {
            drop(roster);
            return fail(state, uid, &format!("no such user: {peer}\r\n")).await;
        }
    };

    let ended = message("end private talk!\r\n")?;
    for other in displaced {
        relay::unicast_in(&mut roster, &ended, other).await;
    }

    let name = roster
        .get(uid)
        .map(|s| s.name.clone())
        .unwrap_or_else(|| uid.to_string());

    relay::deliver(&mut roster, &message("start private talk!\r\n")?, uid).await?;
    relay::unicast_in(
        &mut roster,
        &message(&format!("user {name} invites you to a private talk\r\n"))?,
        peer,
    )
    .await;
    debug!(uid, peer, "Private talk started");
    Ok(Outcome::Continue)
}

/// Pack whole lines into payloads of at most `limit` bytes.
fn pack_lines(lines: &[String], limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for line in lines {
        if !current.is_empty() && current.len() + line.len() > limit {
            chunks.push(std::mem::take(&mut current));
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

async fn fail(state: &ChatState, uid: Uid, text: &str) -> Result<Outcome, SessionError> {
    relay::reply(&state.registry, &message(text)?, uid).await?;
    Ok(Outcome::Failed)
}
