//! User, channel, and network-ban registries.
//!
//! These are the state stores the command interpreter mutates on behalf of
//! remote servers and the local client layer. They are owned by the shared
//! server state and passed around explicitly; there are no ambient globals.

use std::collections::HashMap;

use tracing::debug;

fn lower(s: &str) -> String {
    s.to_ascii_lowercase()
}

// ── Users ─────────────────────────────────────────────────────────────

/// A fully-registered user somewhere on the network.
#[derive(Debug, Clone)]
pub struct User {
    pub nick: String,
    pub ident: String,
    /// Real hostname.
    pub host: String,
    /// Displayed (possibly cloaked) hostname.
    pub display_host: String,
    pub ip: String,
    /// Signon timestamp, seconds since the epoch.
    pub signon: u64,
    /// User mode letters, no leading `+`.
    pub modes: String,
    pub realname: String,
    /// Name of the user's home server.
    pub server: String,
    /// Operator class, set via OPERTYPE.
    pub oper_type: Option<String>,
    /// Last activity, for remote-idle replies. Meaningful for local users.
    pub idle_since: u64,
}

impl User {
    pub fn is_oper(&self) -> bool {
        self.modes.contains('o')
    }

    pub fn hostmask(&self) -> String {
        format!("{}!{}@{}", self.nick, self.ident, self.display_host)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("nick {0} is already in use")]
    NickInUse(String),
    #[error("no such nick {0}")]
    NoSuchNick(String),
}

/// All known users, indexed by nick (case-insensitive).
#[derive(Debug, Default)]
pub struct UserRegistry {
    users: HashMap<String, User>,
}

impl UserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, nick: &str) -> Option<&User> {
        self.users.get(&lower(nick))
    }

    pub fn find_mut(&mut self, nick: &str) -> Option<&mut User> {
        self.users.get_mut(&lower(nick))
    }

    pub fn contains(&self, nick: &str) -> bool {
        self.users.contains_key(&lower(nick))
    }

    pub fn insert(&mut self, user: User) -> Result<(), RegistryError> {
        let key = lower(&user.nick);
        if self.users.contains_key(&key) {
            return Err(RegistryError::NickInUse(user.nick));
        }
        self.users.insert(key, user);
        Ok(())
    }

    pub fn remove(&mut self, nick: &str) -> Option<User> {
        self.users.remove(&lower(nick))
    }

    /// Re-key a user under a new nick. The new nick must be free (or the
    /// same nick in a different case).
    pub fn rename(&mut self, nick: &str, new_nick: &str) -> Result<(), RegistryError> {
        let old_key = lower(nick);
        let new_key = lower(new_nick);
        if old_key != new_key && self.users.contains_key(&new_key) {
            return Err(RegistryError::NickInUse(new_nick.to_owned()));
        }
        let mut user = self
            .users
            .remove(&old_key)
            .ok_or_else(|| RegistryError::NoSuchNick(nick.to_owned()))?;
        user.nick = new_nick.to_owned();
        self.users.insert(new_key, user);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

// ── Channels ──────────────────────────────────────────────────────────

/// Channel membership rank, carried as a prefix sigil in FJOIN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemberRank {
    Normal,
    Voice,  // +
    Halfop, // %
    Op,     // @
}

impl MemberRank {
    pub fn sigil(self) -> &'static str {
        match self {
            MemberRank::Op => "@",
            MemberRank::Halfop => "%",
            MemberRank::Voice => "+",
            MemberRank::Normal => "",
        }
    }

    pub fn mode_char(self) -> Option<char> {
        match self {
            MemberRank::Op => Some('o'),
            MemberRank::Halfop => Some('h'),
            MemberRank::Voice => Some('v'),
            MemberRank::Normal => None,
        }
    }

    /// Split a burst member token like `@ana` into rank and nick.
    pub fn split_token(token: &str) -> (MemberRank, &str) {
        match token.as_bytes().first() {
            Some(b'@') => (MemberRank::Op, &token[1..]),
            Some(b'%') => (MemberRank::Halfop, &token[1..]),
            Some(b'+') => (MemberRank::Voice, &token[1..]),
            _ => (MemberRank::Normal, token),
        }
    }
}

/// A channel topic with attribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub text: String,
    pub set_by: String,
    pub set_at: u64,
}

/// One channel ban entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanEntry {
    pub mask: String,
    pub set_by: String,
    pub set_at: u64,
}

#[derive(Debug, Clone)]
pub struct Channel {
    pub name: String,
    /// Creation timestamp; the network-wide tiebreaker for mode conflicts.
    pub ts: u64,
    /// Flag/parameter modes, no leading `+` (member ranks live in
    /// `members`, bans in `bans`).
    pub modes: String,
    pub key: Option<String>,
    pub topic: Option<Topic>,
    pub bans: Vec<BanEntry>,
    /// nick (lowercase) → rank.
    members: HashMap<String, MemberRank>,
}

impl Channel {
    fn new(name: &str, ts: u64) -> Self {
        Channel {
            name: name.to_owned(),
            ts,
            modes: String::new(),
            key: None,
            topic: None,
            bans: Vec::new(),
            members: HashMap::new(),
        }
    }

    pub fn join(&mut self, nick: &str, rank: MemberRank) {
        self.members.entry(lower(nick)).or_insert(rank);
    }

    pub fn set_rank(&mut self, nick: &str, rank: MemberRank) {
        if let Some(r) = self.members.get_mut(&lower(nick)) {
            *r = rank;
        }
    }

    pub fn part(&mut self, nick: &str) -> bool {
        self.members.remove(&lower(nick)).is_some()
    }

    pub fn has_member(&self, nick: &str) -> bool {
        self.members.contains_key(&lower(nick))
    }

    pub fn rank_of(&self, nick: &str) -> Option<MemberRank> {
        self.members.get(&lower(nick)).copied()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Member nicks (lowercase keys) with their ranks.
    pub fn members(&self) -> impl Iterator<Item = (&String, MemberRank)> {
        self.members.iter().map(|(n, r)| (n, *r))
    }

    /// Apply a mode change to channel state. Handles the rank modes
    /// (`o`/`h`/`v`), bans, the key, and plain flag modes; unknown letters
    /// are recorded as flags so a remote-set mode is never dropped.
    pub fn apply_modes(&mut self, source: &str, set_at: u64, modes: &[String]) {
        let Some((spec, args)) = modes.split_first() else {
            return;
        };
        let mut args = args.iter();
        let mut adding = true;
        for c in spec.chars() {
            match c {
                '+' => adding = true,
                '-' => adding = false,
                'o' | 'h' | 'v' => {
                    if let Some(nick) = args.next() {
                        let rank = match c {
                            'o' => MemberRank::Op,
                            'h' => MemberRank::Halfop,
                            _ => MemberRank::Voice,
                        };
                        if adding {
                            self.set_rank(nick, rank);
                        } else if self.rank_of(nick) == Some(rank) {
                            self.set_rank(nick, MemberRank::Normal);
                        }
                    }
                }
                'b' => {
                    if let Some(mask) = args.next() {
                        if adding {
                            if !self.bans.iter().any(|b| b.mask == *mask) {
                                self.bans.push(BanEntry {
                                    mask: mask.clone(),
                                    set_by: source.to_owned(),
                                    set_at,
                                });
                            }
                        } else {
                            self.bans.retain(|b| b.mask != *mask);
                        }
                    }
                }
                'k' => {
                    if adding {
                        self.key = args.next().cloned();
                        if !self.modes.contains('k') {
                            self.modes.push('k');
                        }
                    } else {
                        let _ = args.next();
                        self.key = None;
                        self.modes.retain(|m| m != 'k');
                    }
                }
                'l' => {
                    if adding {
                        let _ = args.next();
                        if !self.modes.contains('l') {
                            self.modes.push('l');
                        }
                    } else {
                        self.modes.retain(|m| m != 'l');
                    }
                }
                flag => {
                    if adding {
                        if !self.modes.contains(flag) {
                            self.modes.push(flag);
                        }
                    } else {
                        self.modes.retain(|m| m != flag);
                    }
                }
            }
        }
    }
}

/// All known channels, indexed by name (case-insensitive).
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: HashMap<String, Channel>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, name: &str) -> Option<&Channel> {
        self.channels.get(&lower(name))
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut Channel> {
        self.channels.get_mut(&lower(name))
    }

    /// Look up a channel, creating it with the given timestamp if new.
    pub fn get_or_create(&mut self, name: &str, ts: u64) -> &mut Channel {
        self.channels
            .entry(lower(name))
            .or_insert_with(|| Channel::new(name, ts))
    }

    /// Drop a member from every channel; channels left empty are removed.
    pub fn part_all(&mut self, nick: &str) {
        for chan in self.channels.values_mut() {
            chan.part(nick);
        }
        self.channels.retain(|_, c| {
            if c.members.is_empty() {
                debug!(channel = %c.name, "channel emptied, dropping");
                false
            } else {
                true
            }
        });
    }

    /// Re-key a member across every channel after a nick change.
    pub fn rename_member(&mut self, nick: &str, new_nick: &str) {
        let old_key = lower(nick);
        let new_key = lower(new_nick);
        for chan in self.channels.values_mut() {
            if let Some(rank) = chan.members.remove(&old_key) {
                chan.members.insert(new_key.clone(), rank);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

// ── Network bans (x-lines) ────────────────────────────────────────────

/// Ban/block categories propagated between servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XLineCategory {
    /// K: local user@host kill.
    Kill,
    /// G: network-wide user@host ban.
    Global,
    /// Z: IP-address ban.
    Zap,
    /// Q: forbidden nick.
    Nick,
    /// E: exemption from the others.
    Exempt,
}

impl XLineCategory {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "K" => Some(XLineCategory::Kill),
            "G" => Some(XLineCategory::Global),
            "Z" => Some(XLineCategory::Zap),
            "Q" => Some(XLineCategory::Nick),
            "E" => Some(XLineCategory::Exempt),
            _ => None,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            XLineCategory::Kill => "K",
            XLineCategory::Global => "G",
            XLineCategory::Zap => "Z",
            XLineCategory::Nick => "Q",
            XLineCategory::Exempt => "E",
        }
    }

    pub const ALL: [XLineCategory; 5] = [
        XLineCategory::Kill,
        XLineCategory::Global,
        XLineCategory::Zap,
        XLineCategory::Nick,
        XLineCategory::Exempt,
    ];
}

/// One network ban. `set_time` is the original set time, preserved across
/// links so every server reconstructs the same absolute expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XLine {
    pub category: XLineCategory,
    pub mask: String,
    pub source: String,
    pub set_time: u64,
    /// Lifetime in seconds; zero means permanent.
    pub duration: u64,
    pub reason: String,
}

impl XLine {
    pub fn expires_at(&self) -> Option<u64> {
        (self.duration > 0).then(|| self.set_time + self.duration)
    }
}

#[derive(Debug, Default)]
pub struct XLineRegistry {
    lines: Vec<XLine>,
}

impl XLineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a line. Re-adding the same (category, mask) refreshes it in
    /// place, which makes burst replay idempotent.
    pub fn add(&mut self, line: XLine) {
        if let Some(existing) = self
            .lines
            .iter_mut()
            .find(|l| l.category == line.category && l.mask.eq_ignore_ascii_case(&line.mask))
        {
            *existing = line;
        } else {
            self.lines.push(line);
        }
    }

    pub fn remove(&mut self, category: XLineCategory, mask: &str) -> bool {
        let before = self.lines.len();
        self.lines
            .retain(|l| !(l.category == category && l.mask.eq_ignore_ascii_case(mask)));
        self.lines.len() != before
    }

    pub fn by_category(&self, category: XLineCategory) -> impl Iterator<Item = &XLine> {
        self.lines.iter().filter(move |l| l.category == category)
    }

    pub fn iter(&self) -> impl Iterator<Item = &XLine> {
        self.lines.iter()
    }

    /// Drop lines whose absolute expiry has passed.
    pub fn expire(&mut self, now: u64) -> usize {
        let before = self.lines.len();
        self.lines
            .retain(|l| l.expires_at().map(|at| at > now).unwrap_or(true));
        before - self.lines.len()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
