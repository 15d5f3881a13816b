//! Closed command set for the linking protocol.
//!
//! Every inter-server command is a variant of [`LinkCommand`]; dispatch is
//! an exhaustive match instead of a string-comparison chain. Ordinary
//! user-sourced traffic that the link layer only forwards (module commands,
//! WALLOPS-style broadcasts) falls through to [`LinkCommand::Relay`].

use super::message::Message;
use super::registry::XLineCategory;

/// Why a known command could not be turned into a [`LinkCommand`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("{command} expects at least {min} parameters, got {got}")]
    Arity {
        command: &'static str,
        min: usize,
        got: usize,
    },
    #[error("{command} carries a malformed field: {detail}")]
    Malformed {
        command: &'static str,
        detail: String,
    },
}

/// One hop of the remote-idle round trip used for cross-server WHOIS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdleRound {
    /// Prefix = requesting nick; parameter names the target.
    Request { nick: String },
    /// Prefix = answered nick; parameters carry the requester and counters.
    Reply {
        requester: String,
        signon: u64,
        idle: u64,
    },
}

/// The full inter-server command set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    /// Capability-set announcement; exact match required.
    Capab { caps: String },
    /// Cipher negotiation: the named peer is switching the link to its
    /// configured key.
    Cipher { server: String },
    /// Server hello or relayed third-party introduction.
    ServerIntro {
        name: String,
        secret: String,
        hops: u32,
        description: String,
    },
    /// Start-of-burst marker.
    Burst,
    /// End-of-burst marker.
    EndBurst,
    Ping { token: String },
    Pong { token: String },
    Squit { server: String, reason: String },
    /// Full eight-field user introduction.
    Introduce {
        signon: u64,
        nick: String,
        host: String,
        display_host: String,
        ident: String,
        modes: String,
        ip: String,
        realname: String,
    },
    /// One-field nick rename (prefix = old nick).
    NickChange { new_nick: String },
    ForceJoin {
        channel: String,
        ts: u64,
        members: Vec<String>,
    },
    ForceMode { target: String, modes: Vec<String> },
    ForceTopic {
        channel: String,
        ts: u64,
        set_by: String,
        topic: String,
    },
    ForceHost { host: String },
    ForceName { realname: String },
    OperType { class: String },
    Kill { nick: String, reason: String },
    Metadata {
        target: String,
        key: String,
        value: String,
    },
    AddLine {
        category: Option<XLineCategory>,
        raw_category: String,
        mask: String,
        source: String,
        set_time: u64,
        duration: u64,
        reason: String,
    },
    Version { version: String },
    Idle(IdleRound),
    /// Services-forced nick change.
    ForceNick {
        nick: String,
        new_nick: String,
        ts: u64,
    },
    /// Services-forced join.
    ServiceJoin { nick: String, channel: String },
    Rehash { mask: String },
    Error { message: String },
    /// User traffic the link layer routes without special handling:
    /// private/channel messages, membership changes, and anything from a
    /// subsystem this daemon does not interpret itself.
    Quit { reason: String },
    Join { channels: String },
    Part { channel: String, reason: String },
    Topic { channel: String, topic: String },
    Mode { target: String, modes: Vec<String> },
    Kick {
        channel: String,
        nick: String,
        reason: String,
    },
    Invite { nick: String, channel: String },
    Wallops { text: String },
    Privmsg { target: String, text: String },
    Notice { target: String, text: String },
    Relay(Message),
}

fn need(msg: &Message, command: &'static str, min: usize) -> Result<(), CommandError> {
    if msg.params.len() < min {
        Err(CommandError::Arity {
            command,
            min,
            got: msg.params.len(),
        })
    } else {
        Ok(())
    }
}

fn number(msg: &Message, command: &'static str, index: usize) -> Result<u64, CommandError> {
    msg.params[index]
        .parse()
        .map_err(|_| CommandError::Malformed {
            command,
            detail: format!("'{}' is not a number", msg.params[index]),
        })
}

impl LinkCommand {
    /// Map a parsed wire line onto the command set. Unrecognized commands
    /// become [`LinkCommand::Relay`]; the session decides whether their
    /// origin is trustworthy enough to forward.
    pub fn parse(msg: &Message) -> Result<LinkCommand, CommandError> {
        let p = &msg.params;
        let cmd = match msg.command.as_str() {
            "CAPAB" => {
                need(msg, "CAPAB", 1)?;
                LinkCommand::Capab { caps: p[0].clone() }
            }
            "CIPHER" => {
                need(msg, "CIPHER", 1)?;
                LinkCommand::Cipher {
                    server: p[0].clone(),
                }
            }
            "SERVER" => {
                need(msg, "SERVER", 4)?;
                LinkCommand::ServerIntro {
                    name: p[0].clone(),
                    secret: p[1].clone(),
                    hops: p[2].parse().unwrap_or(0),
                    description: p[3].clone(),
                }
            }
            "BURST" => LinkCommand::Burst,
            "ENDBURST" => LinkCommand::EndBurst,
            "PING" => {
                need(msg, "PING", 1)?;
                LinkCommand::Ping {
                    token: p[0].clone(),
                }
            }
            "PONG" => {
                need(msg, "PONG", 1)?;
                LinkCommand::Pong {
                    token: p[0].clone(),
                }
            }
            "SQUIT" => {
                need(msg, "SQUIT", 2)?;
                LinkCommand::Squit {
                    server: p[0].clone(),
                    reason: p[1].clone(),
                }
            }
            "NICK" if p.len() >= 8 => LinkCommand::Introduce {
                signon: number(msg, "NICK", 0)?,
                nick: p[1].clone(),
                host: p[2].clone(),
                display_host: p[3].clone(),
                ident: p[4].clone(),
                modes: p[5].trim_start_matches('+').to_owned(),
                ip: p[6].clone(),
                realname: p[7].clone(),
            },
            "NICK" => {
                need(msg, "NICK", 1)?;
                LinkCommand::NickChange {
                    new_nick: p[0].clone(),
                }
            }
            "FJOIN" => {
                need(msg, "FJOIN", 2)?;
                LinkCommand::ForceJoin {
                    channel: p[0].clone(),
                    ts: number(msg, "FJOIN", 1)?,
                    members: p[2..]
                        .iter()
                        .flat_map(|chunk| chunk.split_whitespace())
                        .map(str::to_owned)
                        .collect(),
                }
            }
            "FMODE" => {
                need(msg, "FMODE", 2)?;
                LinkCommand::ForceMode {
                    target: p[0].clone(),
                    modes: p[1..].to_vec(),
                }
            }
            "FTOPIC" => {
                need(msg, "FTOPIC", 4)?;
                LinkCommand::ForceTopic {
                    channel: p[0].clone(),
                    ts: number(msg, "FTOPIC", 1)?,
                    set_by: p[2].clone(),
                    topic: p[3].clone(),
                }
            }
            "FHOST" => {
                need(msg, "FHOST", 1)?;
                LinkCommand::ForceHost {
                    host: p[0].clone(),
                }
            }
            "FNAME" => {
                need(msg, "FNAME", 1)?;
                LinkCommand::ForceName {
                    realname: p[0].clone(),
                }
            }
            "OPERTYPE" => {
                need(msg, "OPERTYPE", 1)?;
                LinkCommand::OperType {
                    class: p[0].clone(),
                }
            }
            "KILL" => {
                need(msg, "KILL", 2)?;
                LinkCommand::Kill {
                    nick: p[0].clone(),
                    reason: p[1].clone(),
                }
            }
            "METADATA" => {
                need(msg, "METADATA", 3)?;
                LinkCommand::Metadata {
                    target: p[0].clone(),
                    key: p[1].clone(),
                    value: p[2].clone(),
                }
            }
            "ADDLINE" => {
                need(msg, "ADDLINE", 6)?;
                LinkCommand::AddLine {
                    category: XLineCategory::from_tag(&p[0]),
                    raw_category: p[0].clone(),
                    mask: p[1].clone(),
                    source: p[2].clone(),
                    set_time: number(msg, "ADDLINE", 3)?,
                    duration: number(msg, "ADDLINE", 4)?,
                    reason: p[5].clone(),
                }
            }
            "VERSION" => {
                need(msg, "VERSION", 1)?;
                LinkCommand::Version {
                    version: p[0].clone(),
                }
            }
            "IDLE" if p.len() >= 3 => LinkCommand::Idle(IdleRound::Reply {
                requester: p[0].clone(),
                signon: number(msg, "IDLE", 1)?,
                idle: number(msg, "IDLE", 2)?,
            }),
            "IDLE" => {
                need(msg, "IDLE", 1)?;
                LinkCommand::Idle(IdleRound::Request {
                    nick: p[0].clone(),
                })
            }
            "SVSNICK" => {
                need(msg, "SVSNICK", 3)?;
                LinkCommand::ForceNick {
                    nick: p[0].clone(),
                    new_nick: p[1].clone(),
                    ts: number(msg, "SVSNICK", 2)?,
                }
            }
            "SVSJOIN" => {
                need(msg, "SVSJOIN", 2)?;
                LinkCommand::ServiceJoin {
                    nick: p[0].clone(),
                    channel: p[1].clone(),
                }
            }
            "REHASH" => {
                need(msg, "REHASH", 1)?;
                LinkCommand::Rehash {
                    mask: p[0].clone(),
                }
            }
            "ERROR" => LinkCommand::Error {
                message: p.first().cloned().unwrap_or_default(),
            },
            "QUIT" => LinkCommand::Quit {
                reason: p.first().cloned().unwrap_or_default(),
            },
            "JOIN" => {
                need(msg, "JOIN", 1)?;
                LinkCommand::Join {
                    channels: p[0].clone(),
                }
            }
            "PART" => {
                need(msg, "PART", 1)?;
                LinkCommand::Part {
                    channel: p[0].clone(),
                    reason: p.get(1).cloned().unwrap_or_default(),
                }
            }
            "TOPIC" => {
                need(msg, "TOPIC", 2)?;
                LinkCommand::Topic {
                    channel: p[0].clone(),
                    topic: p[1].clone(),
                }
            }
            // Services-compatible alias; same semantics on this side.
            "MODE" | "SVSMODE" => {
                need(msg, "MODE", 2)?;
                LinkCommand::Mode {
                    target: p[0].clone(),
                    modes: p[1..].to_vec(),
                }
            }
            "KICK" => {
                need(msg, "KICK", 2)?;
                LinkCommand::Kick {
                    channel: p[0].clone(),
                    nick: p[1].clone(),
                    reason: p.get(2).cloned().unwrap_or_default(),
                }
            }
            "INVITE" => {
                need(msg, "INVITE", 2)?;
                LinkCommand::Invite {
                    nick: p[0].clone(),
                    channel: p[1].clone(),
                }
            }
            "WALLOPS" => {
                need(msg, "WALLOPS", 1)?;
                LinkCommand::Wallops {
                    text: p[0].clone(),
                }
            }
            "PRIVMSG" => {
                need(msg, "PRIVMSG", 2)?;
                LinkCommand::Privmsg {
                    target: p[0].clone(),
                    text: p[1].clone(),
                }
            }
            "NOTICE" => {
                need(msg, "NOTICE", 2)?;
                LinkCommand::Notice {
                    target: p[0].clone(),
                    text: p[1].clone(),
                }
            }
            _ => LinkCommand::Relay(msg.clone()),
        };
        Ok(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(line: &str) -> LinkCommand {
        LinkCommand::parse(&Message::parse(line).unwrap()).unwrap()
    }

    #[test]
    fn server_hello() {
        assert_eq!(
            parse("SERVER leaf.tarn.test sekrit 0 :Tarn leaf"),
            LinkCommand::ServerIntro {
                name: "leaf.tarn.test".into(),
                secret: "sekrit".into(),
                hops: 0,
                description: "Tarn leaf".into(),
            }
        );
    }

    #[test]
    fn nick_arity_disambiguates() {
        let intro = parse(
            ":hub.tarn.test NICK 1136214245 ana host.example cloak.example ana +iw 10.0.0.1 :Ana",
        );
        assert!(matches!(
            intro,
            LinkCommand::Introduce { ref nick, signon: 1136214245, ref modes, .. }
                if nick == "ana" && modes == "iw"
        ));

        assert_eq!(
            parse(":ana NICK :ana_"),
            LinkCommand::NickChange {
                new_nick: "ana_".into()
            }
        );
    }

    #[test]
    fn idle_arity_disambiguates() {
        assert_eq!(
            parse(":ana IDLE :bee"),
            LinkCommand::Idle(IdleRound::Request { nick: "bee".into() })
        );
        assert_eq!(
            parse(":bee IDLE ana 1136214245 :42"),
            LinkCommand::Idle(IdleRound::Reply {
                requester: "ana".into(),
                signon: 1136214245,
                idle: 42,
            })
        );
    }

    #[test]
    fn fjoin_members_flatten() {
        let cmd = parse(":hub.tarn.test FJOIN #tarn 1136214245 @ana +bee cay");
        assert_eq!(
            cmd,
            LinkCommand::ForceJoin {
                channel: "#tarn".into(),
                ts: 1136214245,
                members: vec!["@ana".into(), "+bee".into(), "cay".into()],
            }
        );
    }

    #[test]
    fn fjoin_trailing_member_list_flattens() {
        // A batched continuation line may carry members in the trailing param.
        let cmd = parse(":hub.tarn.test FJOIN #tarn 10 :@ana +bee");
        assert_eq!(
            cmd,
            LinkCommand::ForceJoin {
                channel: "#tarn".into(),
                ts: 10,
                members: vec!["@ana".into(), "+bee".into()],
            }
        );
    }

    #[test]
    fn addline_keeps_unknown_categories() {
        let cmd = parse(":hub.tarn.test ADDLINE G *@bad.example ana 1136214245 3600 :spam");
        assert!(matches!(
            cmd,
            LinkCommand::AddLine {
                category: Some(XLineCategory::Global),
                ref mask,
                set_time: 1136214245,
                duration: 3600,
                ..
            } if mask == "*@bad.example"
        ));

        let cmd = parse(":hub.tarn.test ADDLINE X mask src 1 2 :nope");
        assert!(matches!(
            cmd,
            LinkCommand::AddLine { category: None, ref raw_category, .. } if raw_category == "X"
        ));
    }

    #[test]
    fn svsmode_is_mode() {
        assert_eq!(
            parse(":services SVSMODE ana :+iw"),
            LinkCommand::Mode {
                target: "ana".into(),
                modes: vec!["+iw".into()],
            }
        );
    }

    #[test]
    fn unknown_commands_relay() {
        let msg = Message::parse(":ana SAMODE #tarn +o bee").unwrap();
        assert_eq!(
            LinkCommand::parse(&msg).unwrap(),
            LinkCommand::Relay(msg.clone())
        );
    }

    #[test]
    fn arity_violations_are_reported() {
        let msg = Message::parse("SQUIT leaf.tarn.test").unwrap();
        assert_eq!(
            LinkCommand::parse(&msg),
            Err(CommandError::Arity {
                command: "SQUIT",
                min: 2,
                got: 1
            })
        );
    }

    #[test]
    fn bad_numbers_are_reported() {
        let msg = Message::parse(":hub FTOPIC #tarn soon ana :hi").unwrap();
        assert!(matches!(
            LinkCommand::parse(&msg),
            Err(CommandError::Malformed { command: "FTOPIC", .. })
        ));
    }
}
