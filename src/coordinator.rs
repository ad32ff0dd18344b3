//! Playback session state: which station is active, whether it plays, and at
//! what gain. Every operation returns the actions the audio output must apply,
//! so the controller stays the only owner of the output resource.

use crate::models::{NewStation, Station, StationStatus};
use rand::{distributions::Alphanumeric, Rng};
use tracing::{debug, info, warn};
use url::Url;

const DEFAULT_COVER: &str =
    "https://images.unsplash.com/photo-1493225255756-d9584f8606e9?q=80&w=400&auto=format&fit=crop";

/// Identifies one playback start request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayToken {
    seq: u64,
    pub station_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutputAction {
    Load { token: PlayToken, url: String },
    Pause,
    Resume,
    Stop,
    SetGain(f32),
}

/// Why playback did not start. Both kinds are handled identically.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlaybackError {
    #[error("stream unreachable: {0}")]
    Unreachable(String),
    #[error("playback rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Station not found: {0}")]
    UnknownStation(String),
    #[error("Station name is required")]
    MissingName,
    #[error("Stream URL is required")]
    MissingStreamUrl,
    #[error("Invalid stream URL: {0}")]
    InvalidStreamUrl(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartResult {
    Applied,
    Stale,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub active: Option<Station>,
    pub playing: bool,
    pub volume: f32,
    pub muted: bool,
    pub gain: f32,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
struct Session {
    active: Option<String>,
    playing: bool,
    volume: f32,
    muted: bool,
    pending: Option<PlayToken>,
    /// Token of the source the output currently holds.
    loaded: Option<PlayToken>,
    error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Coordinator {
    stations: Vec<Station>,
    session: Session,
    next_seq: u64,
}

impl Coordinator {
    pub fn new(stations: Vec<Station>, volume: f32, muted: bool) -> Self {
        Self {
            stations,
            session: Session {
                active: None,
                playing: false,
                volume: clamp_volume(volume),
                muted,
                pending: None,
                loaded: None,
                error: None,
            },
            next_seq: 0,
        }
    }

    pub fn stations(&self) -> &[Station] {
        &self.stations
    }

    pub fn station(&self, id: &str) -> Option<&Station> {
        self.stations.iter().find(|s| s.id == id)
    }

    #[cfg(test)]
    pub fn active_id(&self) -> Option<&str> {
        self.session.active.as_deref()
    }

    #[cfg(test)]
    pub fn is_playing(&self) -> bool {
        self.session.playing
    }

    pub fn volume(&self) -> f32 {
        self.session.volume
    }

    pub fn effective_gain(&self) -> f32 {
        if self.session.muted {
            0.0
        } else {
            self.session.volume
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            active: self.session.active.as_deref().and_then(|id| self.station(id)).cloned(),
            playing: self.session.playing,
            volume: self.session.volume,
            muted: self.session.muted,
            gain: self.effective_gain(),
            error: self.session.error.clone(),
        }
    }

    /// Marks a station active without starting it, e.g. the last station on startup.
    pub fn preselect(&mut self, id: &str) -> Result<(), CoordinatorError> {
        if self.station(id).is_none() {
            return Err(CoordinatorError::UnknownStation(id.to_string()));
        }
        self.session.active = Some(id.to_string());
        Ok(())
    }

    pub fn select_and_play(&mut self, id: &str) -> Result<Vec<OutputAction>, CoordinatorError> {
        let station = self
            .station(id)
            .ok_or_else(|| CoordinatorError::UnknownStation(id.to_string()))?;
        let url = station.stream_url.clone();

        if self.session.active.as_deref() == Some(id) && self.session.playing {
            self.session.playing = false;
            return Ok(vec![OutputAction::Pause]);
        }

        self.session.active = Some(id.to_string());
        self.session.error = None;
        Ok(vec![self.start(url)])
    }

    pub fn toggle_play(&mut self) -> Vec<OutputAction> {
        let Some(id) = self.session.active.clone() else {
            return vec![];
        };

        if self.session.playing {
            self.session.playing = false;
            return vec![OutputAction::Pause];
        }

        self.session.error = None;
        if self.session.loaded.as_ref().is_some_and(|t| t.station_id == id) {
            self.session.playing = true;
            return vec![OutputAction::Resume];
        }
        if self.session.pending.as_ref().is_some_and(|t| t.station_id == id) {
            // Start still in flight; it resumes the output when it lands.
            self.session.playing = true;
            return vec![];
        }
        let url = self.station(&id).map(|s| s.stream_url.clone());
        match url {
            Some(url) => vec![self.start(url)],
            None => vec![],
        }
    }

    fn start(&mut self, url: String) -> OutputAction {
        self.next_seq += 1;
        let token = PlayToken {
            seq: self.next_seq,
            station_id: self.session.active.clone().unwrap_or_default(),
        };
        self.session.pending = Some(token.clone());
        self.session.loaded = None;
        self.session.playing = true;
        OutputAction::Load { token, url }
    }

    /// Applies the outcome of a start request, unless a newer request superseded it.
    pub fn start_completed(
        &mut self,
        token: &PlayToken,
        outcome: Result<(), PlaybackError>,
    ) -> (StartResult, Vec<OutputAction>) {
        if self.session.pending.as_ref() != Some(token) {
            debug!(station = %token.station_id, seq = token.seq, "discarding stale start result");
            return (StartResult::Stale, vec![]);
        }
        self.session.pending = None;

        match outcome {
            Ok(()) => {
                self.session.loaded = Some(token.clone());
                info!(station = %token.station_id, "playback started");
                // Toggles made while the start was in flight decide the final state.
                let settle = if self.session.playing {
                    OutputAction::Resume
                } else {
                    OutputAction::Pause
                };
                (StartResult::Applied, vec![settle])
            }
            Err(e) => {
                warn!(station = %token.station_id, error = %e, "playback did not start");
                self.session.playing = false;
                self.session.error = Some(e.to_string());
                (StartResult::Applied, vec![])
            }
        }
    }

    /// The output finished or lost the source loaded for `token`.
    pub fn playback_ended(&mut self, token: &PlayToken) {
        if self.session.loaded.as_ref() != Some(token) {
            return;
        }
        self.session.loaded = None;
        self.session.playing = false;
    }

    pub fn set_volume(&mut self, level: f32) -> Vec<OutputAction> {
        self.session.volume = clamp_volume(level);
        vec![OutputAction::SetGain(self.effective_gain())]
    }

    pub fn set_muted(&mut self, muted: bool) -> Vec<OutputAction> {
        self.session.muted = muted;
        vec![OutputAction::SetGain(self.effective_gain())]
    }

    pub fn add_station(&mut self, form: NewStation) -> Result<Station, CoordinatorError> {
        let station = build_station(form, |id| self.station(id).is_some())?;
        self.stations.push(station.clone());
        Ok(station)
    }

    /// Removes a station; if it was active the session is cleared in the same step.
    pub fn delete_station(&mut self, id: &str) -> Result<(Station, Vec<OutputAction>), CoordinatorError> {
        let idx = self
            .stations
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| CoordinatorError::UnknownStation(id.to_string()))?;
        let removed = self.stations.remove(idx);

        let mut actions = vec![];
        if self.session.active.as_deref() == Some(id) {
            self.session.active = None;
            self.session.playing = false;
            self.session.pending = None;
            self.session.loaded = None;
            self.session.error = None;
            actions.push(OutputAction::Stop);
        }
        Ok((removed, actions))
    }
}

fn clamp_volume(level: f32) -> f32 {
    if level.is_nan() {
        0.0
    } else {
        level.clamp(0.0, 1.0)
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

fn build_station(
    form: NewStation,
    id_taken: impl Fn(&str) -> bool,
) -> Result<Station, CoordinatorError> {
    let name = form.name.trim();
    if name.is_empty() {
        return Err(CoordinatorError::MissingName);
    }
    let stream_url = form.stream_url.trim();
    if stream_url.is_empty() {
        return Err(CoordinatorError::MissingStreamUrl);
    }
    let parsed = Url::parse(stream_url)
        .map_err(|e| CoordinatorError::InvalidStreamUrl(format!("{stream_url}: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(CoordinatorError::InvalidStreamUrl(format!(
            "unsupported scheme {}",
            parsed.scheme()
        )));
    }

    let mut id = random_token(9);
    while id_taken(&id) {
        id = random_token(9);
    }

    let or_default = |s: &str, d: &str| {
        let s = s.trim();
        if s.is_empty() { d.to_string() } else { s.to_string() }
    };

    Ok(Station {
        id,
        name: name.to_string(),
        genre: or_default(&form.genre, "General"),
        description: or_default(&form.description, "Sin descripción"),
        stream_url: parsed.to_string(),
        cover_image: or_default(&form.cover_image, DEFAULT_COVER),
        listeners: 0,
        status: StationStatus::Offline,
        is_premium: false,
        stream_key: format!("ed_live_{}", random_token(6)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn station(id: &str) -> Station {
        Station {
            id: id.to_string(),
            name: format!("Station {id}"),
            genre: "Lo-Fi".to_string(),
            description: String::new(),
            stream_url: format!("https://example.com/{id}"),
            cover_image: String::new(),
            listeners: 0,
            status: StationStatus::Online,
            is_premium: false,
            stream_key: "k".to_string(),
        }
    }

    fn two_stations() -> Coordinator {
        Coordinator::new(vec![station("a"), station("b")], 0.5, false)
    }

    fn load_token(actions: &[OutputAction]) -> PlayToken {
        match actions {
            [OutputAction::Load { token, .. }] => token.clone(),
            other => panic!("expected a single load, got {other:?}"),
        }
    }

    #[test]
    fn repeated_select_toggles_playing() {
        let mut c = two_stations();
        let mut expected = true;
        for _ in 0..7 {
            c.select_and_play("a").unwrap();
            assert_eq!(c.is_playing(), expected);
            assert_eq!(c.active_id(), Some("a"));
            expected = !expected;
        }
    }

    #[test]
    fn select_loads_source_and_second_select_pauses() {
        let mut c = two_stations();
        let actions = c.select_and_play("b").unwrap();
        assert_eq!(
            actions,
            vec![OutputAction::Load {
                token: PlayToken { seq: 1, station_id: "b".to_string() },
                url: "https://example.com/b".to_string(),
            }]
        );
        assert_eq!(c.select_and_play("b").unwrap(), vec![OutputAction::Pause]);
    }

    #[test]
    fn unknown_station_is_rejected() {
        let mut c = two_stations();
        assert_eq!(
            c.select_and_play("zz"),
            Err(CoordinatorError::UnknownStation("zz".to_string()))
        );
        assert_eq!(c.active_id(), None);
    }

    #[test]
    fn failed_start_reverts_playing() {
        let mut c = two_stations();
        let token = load_token(&c.select_and_play("a").unwrap());
        assert!(c.is_playing());

        let (res, actions) = c.start_completed(&token, Err(PlaybackError::Unreachable("404".into())));
        assert_eq!(res, StartResult::Applied);
        assert!(actions.is_empty());
        assert!(!c.is_playing());
        assert_eq!(c.active_id(), Some("a"));
        assert!(c.snapshot().error.unwrap().contains("404"));

        // Toggling again issues a fresh start rather than resuming nothing.
        let retry = c.toggle_play();
        assert_ne!(load_token(&retry), token);
        assert!(c.snapshot().error.is_none());
    }

    #[test]
    fn stale_result_for_superseded_station_is_discarded() {
        let mut c = two_stations();
        let first = load_token(&c.select_and_play("a").unwrap());
        let second = load_token(&c.select_and_play("b").unwrap());

        let (res, _) = c.start_completed(&first, Err(PlaybackError::Rejected("gone".into())));
        assert_eq!(res, StartResult::Stale);
        assert!(c.is_playing());
        assert_eq!(c.active_id(), Some("b"));

        let (res, _) = c.start_completed(&second, Ok(()));
        assert_eq!(res, StartResult::Applied);
        assert!(c.is_playing());
    }

    #[test]
    fn pause_during_start_is_reapplied_when_start_lands() {
        let mut c = two_stations();
        let token = load_token(&c.select_and_play("a").unwrap());
        assert_eq!(c.toggle_play(), vec![OutputAction::Pause]);

        let (_, actions) = c.start_completed(&token, Ok(()));
        assert_eq!(actions, vec![OutputAction::Pause]);
        assert!(!c.is_playing());

        assert_eq!(c.toggle_play(), vec![OutputAction::Resume]);
        assert!(c.is_playing());
    }

    #[test]
    fn resume_during_start_does_not_issue_second_load() {
        let mut c = two_stations();
        let token = load_token(&c.select_and_play("a").unwrap());
        c.toggle_play();
        assert!(c.toggle_play().is_empty());
        assert!(c.is_playing());
        let (_, actions) = c.start_completed(&token, Ok(()));
        assert_eq!(actions, vec![OutputAction::Resume]);
    }

    #[test]
    fn toggle_without_active_station_is_noop() {
        let mut c = two_stations();
        assert!(c.toggle_play().is_empty());
        assert!(!c.is_playing());
    }

    #[test]
    fn effective_gain_follows_mute() {
        let mut c = two_stations();
        for i in 0..=20 {
            let v = i as f32 / 20.0;
            for muted in [false, true] {
                c.set_muted(muted);
                let actions = c.set_volume(v);
                let expected = if muted { 0.0 } else { v };
                assert_eq!(actions, vec![OutputAction::SetGain(expected)]);
                assert_eq!(c.effective_gain(), expected);
                assert_eq!(c.volume(), v);
            }
        }
    }

    #[test]
    fn volume_is_clamped() {
        let mut c = two_stations();
        c.set_volume(1.7);
        assert_eq!(c.volume(), 1.0);
        c.set_volume(-0.2);
        assert_eq!(c.volume(), 0.0);
        c.set_volume(f32::NAN);
        assert_eq!(c.volume(), 0.0);
    }

    #[test]
    fn mute_keeps_stored_volume() {
        let mut c = two_stations();
        c.set_volume(0.8);
        assert_eq!(c.set_muted(true), vec![OutputAction::SetGain(0.0)]);
        assert_eq!(c.volume(), 0.8);
        assert_eq!(c.set_muted(false), vec![OutputAction::SetGain(0.8)]);
    }

    #[test]
    fn deleting_active_station_clears_session() {
        let mut c = two_stations();
        let token = load_token(&c.select_and_play("a").unwrap());
        let (removed, actions) = c.delete_station("a").unwrap();
        assert_eq!(removed.id, "a");
        assert_eq!(actions, vec![OutputAction::Stop]);

        let snap = c.snapshot();
        assert!(snap.active.is_none());
        assert!(!snap.playing);

        let (res, _) = c.start_completed(&token, Ok(()));
        assert_eq!(res, StartResult::Stale);
        assert!(c.toggle_play().is_empty());
    }

    #[test]
    fn deleting_other_station_keeps_playback() {
        let mut c = two_stations();
        c.select_and_play("b").unwrap();
        let (_, actions) = c.delete_station("a").unwrap();
        assert!(actions.is_empty());
        assert_eq!(c.active_id(), Some("b"));
        assert!(c.is_playing());
    }

    #[test]
    fn delete_first_of_two_leaves_second() {
        let mut c = two_stations();
        c.delete_station("a").unwrap();
        let ids: Vec<&str> = c.stations().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["b"]);
        assert!(c.delete_station("a").is_err());
    }

    #[test]
    fn ended_stream_stops_playing() {
        let mut c = two_stations();
        let token = load_token(&c.select_and_play("a").unwrap());
        c.start_completed(&token, Ok(()));
        c.playback_ended(&token);
        assert!(!c.is_playing());
        assert!(matches!(c.toggle_play().as_slice(), [OutputAction::Load { .. }]));
    }

    #[test]
    fn add_station_applies_form_defaults() {
        let mut c = two_stations();
        let st = c
            .add_station(NewStation {
                name: "  Urban Beats ".to_string(),
                stream_url: "https://stream.example.com/live".to_string(),
                ..NewStation::default()
            })
            .unwrap();
        assert_eq!(st.name, "Urban Beats");
        assert_eq!(st.genre, "General");
        assert_eq!(st.description, "Sin descripción");
        assert_eq!(st.id.len(), 9);
        assert!(st.stream_key.starts_with("ed_live_"));
        assert_eq!(st.status, StationStatus::Offline);
        assert_eq!(c.stations().len(), 3);
    }

    #[test]
    fn add_station_validates_required_fields() {
        let mut c = two_stations();
        let no_name = NewStation { stream_url: "https://x.y/z".into(), ..NewStation::default() };
        assert_eq!(c.add_station(no_name), Err(CoordinatorError::MissingName));

        let no_url = NewStation { name: "n".into(), ..NewStation::default() };
        assert_eq!(c.add_station(no_url), Err(CoordinatorError::MissingStreamUrl));

        let bad = NewStation { name: "n".into(), stream_url: "file:///etc/passwd".into(), ..NewStation::default() };
        assert!(matches!(c.add_station(bad), Err(CoordinatorError::InvalidStreamUrl(_))));
        assert_eq!(c.stations().len(), 2);
    }
}
