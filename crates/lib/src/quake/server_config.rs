//! Game server configuration and its console-script rendering.
//!
//! The YAML document is overlaid on [`ServerConfig::default`]; missing keys keep
//! their default values. Rendering walks a fixed, ordered cvar schema through a
//! [`CvarVisitor`], so the output is deterministic for any parsed config.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Script the server executes on startup (`+exec server.cfg`).
pub const SERVER_SCRIPT: &str = "server.cfg";
pub const BASE_GAME: &str = "baseq3";
/// Standalone map rotation script written next to `server.cfg`.
pub const MAPS_SCRIPT: &str = "maps.cfg";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum GameType {
    #[default]
    FreeForAll,
    Tournament,
    SinglePlayer,
    TeamDeathmatch,
    CaptureTheFlag,
}

impl GameType {
    /// Numeric value of `g_gametype`.
    pub fn code(self) -> i64 {
        match self {
            GameType::FreeForAll => 0,
            GameType::Tournament => 1,
            GameType::SinglePlayer => 2,
            GameType::TeamDeathmatch => 3,
            GameType::CaptureTheFlag => 4,
        }
    }
}

impl TryFrom<String> for GameType {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "FreeForAll" | "FFA" => Ok(GameType::FreeForAll),
            "Tournament" => Ok(GameType::Tournament),
            "SinglePlayer" => Ok(GameType::SinglePlayer),
            "TeamDeathmatch" => Ok(GameType::TeamDeathmatch),
            "CaptureTheFlag" | "CTF" => Ok(GameType::CaptureTheFlag),
            other => Err(format!("unknown GameType: {}", other)),
        }
    }
}

/// Top-level server configuration (limits, rules, file system, rotation).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub frag_limit: i64,
    #[serde(with = "human_duration")]
    pub time_limit: Duration,
    pub bot: BotConfig,
    pub game: GameConfig,
    pub fs: FileServerConfig,
    pub server: ServerSection,
    /// Raw console commands appended after the rotation.
    pub commands: Vec<String>,
    pub maps: Vec<Map>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BotConfig {
    pub min_players: i64,
    pub no_chat: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GameConfig {
    pub force_respawn: bool,
    #[serde(rename = "type")]
    pub game_type: GameType,
    #[serde(with = "human_duration")]
    pub inactivity: Duration,
    pub log: String,
    pub motd: String,
    pub password: String,
    pub quad_factor: i64,
    #[serde(alias = "spSkill")]
    pub single_player_skill: i64,
    pub weapon_respawn: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FileServerConfig {
    pub base_game: String,
    pub base_path: String,
    pub copy_files: bool,
    pub debug: bool,
    pub game: String,
    pub home_path: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerSection {
    pub allow_download: bool,
    #[serde(alias = "downloadURL")]
    pub download_url: String,
    pub hostname: String,
    pub max_clients: i64,
    pub password: String,
}

/// One rotation entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Map {
    pub name: String,
    #[serde(rename = "type", default)]
    pub game_type: GameType,
    #[serde(default)]
    pub capture_limit: i64,
    #[serde(default)]
    pub frag_limit: i64,
    #[serde(default, with = "human_duration")]
    pub time_limit: Duration,
}

impl Map {
    pub fn new(name: impl Into<String>, game_type: GameType) -> Self {
        Self {
            name: name.into(),
            game_type,
            capture_limit: 0,
            frag_limit: 0,
            time_limit: Duration::ZERO,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            frag_limit: 25,
            time_limit: Duration::from_secs(15 * 60),
            bot: BotConfig::default(),
            game: GameConfig::default(),
            fs: FileServerConfig::default(),
            server: ServerSection::default(),
            commands: Vec::new(),
            maps: vec![
                Map::new("q3dm7", GameType::FreeForAll),
                Map::new("q3dm17", GameType::FreeForAll),
            ],
        }
    }
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            min_players: 0,
            no_chat: true,
        }
    }
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            force_respawn: false,
            game_type: GameType::FreeForAll,
            inactivity: Duration::from_secs(10 * 60),
            log: String::new(),
            motd: "Welcome to Critical Stack".to_string(),
            password: String::new(),
            quad_factor: 3,
            single_player_skill: 2,
            weapon_respawn: 3,
        }
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            allow_download: false,
            download_url: String::new(),
            hostname: "quakekube".to_string(),
            max_clients: 12,
            password: "changeme".to_string(),
        }
    }
}

/// How a cvar is written to the script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// `seta name "value"`
    Archive,
    /// `sets name value`, skipped when the value is empty.
    ServerInfo,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CvarValue<'a> {
    Int(i64),
    Bool(bool),
    Str(&'a str),
    /// Rendered as whole minutes.
    Minutes(Duration),
    /// Rendered as whole seconds.
    Seconds(Duration),
}

impl std::fmt::Display for CvarValue<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CvarValue::Int(n) => write!(f, "{}", n),
            CvarValue::Bool(b) => f.write_str(if *b { "1" } else { "0" }),
            CvarValue::Str(s) => f.write_str(s),
            CvarValue::Minutes(d) => write!(f, "{}", d.as_secs() / 60),
            CvarValue::Seconds(d) => write!(f, "{}", d.as_secs()),
        }
    }
}

/// Receives every cvar of a [`ServerConfig`] in schema order.
pub trait CvarVisitor {
    fn cvar(&mut self, name: &'static str, directive: Directive, value: CvarValue<'_>);
}

impl ServerConfig {
    /// Parse a YAML document; an empty document yields the default config.
    pub fn from_yaml(text: &str, path: &Path) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).map_err(|e| Error::config(path, e))
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::config(path, e))?;
        Self::from_yaml(&text, path)
    }

    /// Walk the fixed cvar schema in output order.
    pub fn visit_cvars<V: CvarVisitor>(&self, v: &mut V) {
        use CvarValue::*;
        use Directive::*;

        v.cvar("fraglimit", Archive, Int(self.frag_limit));
        v.cvar("timelimit", Archive, Minutes(self.time_limit));

        v.cvar("bot_minplayers", Archive, Int(self.bot.min_players));
        v.cvar("bot_nochat", Archive, Bool(self.bot.no_chat));

        let g = &self.game;
        v.cvar("g_forcerespawn", Archive, Bool(g.force_respawn));
        v.cvar("g_gametype", Archive, Int(g.game_type.code()));
        v.cvar("g_inactivity", Archive, Seconds(g.inactivity));
        v.cvar("g_log", Archive, Str(&g.log));
        v.cvar("g_motd", Archive, Str(&g.motd));
        v.cvar("g_password", Archive, Str(&g.password));
        v.cvar("g_quadfactor", Archive, Int(g.quad_factor));
        v.cvar("g_spSkill", Archive, Int(g.single_player_skill));
        v.cvar("g_weaponrespawn", Archive, Int(g.weapon_respawn));

        let fs = &self.fs;
        v.cvar("fs_basegame", Archive, Str(&fs.base_game));
        v.cvar("fs_basepath", Archive, Str(&fs.base_path));
        v.cvar("fs_copyfiles", Archive, Bool(fs.copy_files));
        v.cvar("fs_debug", Archive, Bool(fs.debug));
        v.cvar("fs_game", Archive, Str(&fs.game));
        v.cvar("fs_homepath", Archive, Str(&fs.home_path));

        let sv = &self.server;
        v.cvar("sv_allowDownload", Archive, Bool(sv.allow_download));
        v.cvar("sv_dlURL", ServerInfo, Str(&sv.download_url));
        v.cvar("sv_hostname", Archive, Str(&sv.hostname));
        v.cvar("sv_maxclients", Archive, Int(sv.max_clients));
        v.cvar("rconpassword", Archive, Str(&sv.password));
    }

    /// Render the native console script: cvars, map rotation, then raw commands.
    pub fn to_console_script(&self) -> String {
        let mut w = ScriptWriter::default();
        self.visit_cvars(&mut w);
        let mut out = w.out;
        out.push_str(&render_rotation(&self.maps));
        for cmd in &self.commands {
            out.push_str(cmd);
            out.push('\n');
        }
        out
    }
}

#[derive(Default)]
struct ScriptWriter {
    out: String,
}

impl CvarVisitor for ScriptWriter {
    fn cvar(&mut self, name: &'static str, directive: Directive, value: CvarValue<'_>) {
        let value = value.to_string();
        // Writing into a String cannot fail.
        let _ = match directive {
            Directive::Archive => writeln!(self.out, "seta {} {}", name, quote(&value)),
            Directive::ServerInfo if value.is_empty() => Ok(()),
            Directive::ServerInfo => writeln!(self.out, "sets {} {}", name, value),
        };
    }
}

/// Chain the rotation through `d<i>` variables, wrapping back to `d0`.
pub fn render_rotation(maps: &[Map]) -> String {
    let mut out = String::new();
    if maps.is_empty() {
        return out;
    }
    for (i, m) in maps.iter().enumerate() {
        let mut cmds = vec![format!("g_gametype {}", m.game_type.code())];
        if m.game_type == GameType::CaptureTheFlag && m.capture_limit != 0 {
            cmds.push(format!("capturelimit {}", m.capture_limit));
        }
        if m.frag_limit != 0 {
            cmds.push(format!("fraglimit {}", m.frag_limit));
        }
        if !m.time_limit.is_zero() {
            cmds.push(format!("timelimit {}", CvarValue::Minutes(m.time_limit)));
        }
        cmds.push(format!("map {}", m.name));
        let next = if i + 1 < maps.len() { i + 1 } else { 0 };
        cmds.push(format!("set nextmap vstr d{}", next));
        let _ = writeln!(out, "set d{} \"seta {}\"", i, cmds.join(" ; "));
    }
    out.push_str("vstr d0\n");
    out
}

/// Double-quote a value, escaping quotes, backslashes and control characters.
fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Location of the generated script under the assets root.
pub fn script_path(assets_dir: &Path) -> PathBuf {
    assets_dir.join(BASE_GAME).join(SERVER_SCRIPT)
}

/// Write `script` to `<assets_dir>/baseq3/server.cfg`, creating the directory.
pub async fn write_script(assets_dir: &Path, script: &str) -> Result<PathBuf> {
    write_game_file(script_path(assets_dir), script).await
}

/// Parse a rotation file: a YAML sequence of maps. An empty document is an empty rotation.
pub fn rotation_from_yaml(text: &str, path: &Path) -> Result<Vec<Map>> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_yaml::from_str(text).map_err(|e| Error::config(path, e))
}

pub async fn load_rotation(path: &Path) -> Result<Vec<Map>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::config(path, e))?;
    rotation_from_yaml(&text, path)
}

/// Write the rendered rotation to `<assets_dir>/baseq3/maps.cfg`.
pub async fn write_rotation(assets_dir: &Path, maps: &[Map]) -> Result<PathBuf> {
    let path = assets_dir.join(BASE_GAME).join(MAPS_SCRIPT);
    write_game_file(path, &render_rotation(maps)).await
}

async fn write_game_file(path: PathBuf, contents: &str) -> Result<PathBuf> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io(format!("creating {}", parent.display()), e))?;
    }
    tokio::fs::write(&path, contents)
        .await
        .map_err(|e| Error::io(format!("writing {}", path.display()), e))?;
    Ok(path)
}

mod human_duration {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(d)?;
        humantime::parse_duration(s.trim()).map_err(serde::de::Error::custom)
    }
}
