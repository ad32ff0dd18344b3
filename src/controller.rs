use crate::config::{config_path, AppConfig};
use crate::coordinator::{Coordinator, OutputAction, PlayToken, PlaybackError, SessionSnapshot, StartResult};
use crate::models::{NewStation, Plan, Station, User};
use crate::mpv::{EndReason, MpvCommand, MpvEvent, MpvProcess};
use crate::store::{spawn_writer, LocalStore, Persist};
use crate::studio::{StudioClient, StudioError};
use crate::voice::{ClockOutput, PcmFormat, VoiceOutput, VoicePlayer};
use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const PAYMENT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default)]
pub struct StudioState {
    pub generating: bool,
    pub synthesizing: bool,
    pub script: Option<String>,
    pub chunks_scheduled: usize,
    pub chunks_dropped: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ControllerState {
    pub session: SessionSnapshot,
    pub stations: Vec<Station>,
    pub user: Option<User>,
    pub upgrading: bool,
    pub media_title: Option<String>,
    pub notice: Option<String>,
    pub studio: StudioState,
}

impl ControllerState {
    pub fn label_text(&self) -> String {
        if let Some(st) = &self.session.active {
            let name = st.name.trim();
            if !name.is_empty() {
                return name.to_string();
            }
        }

        if let Some(t) = self.media_title.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            return t.to_string();
        }

        "radio".to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UiCommand {
    SelectAndPlay(String),
    TogglePlay,
    SetVolume(f32),
    SetMuted(bool),
    AddStation(NewStation),
    /// Sent only after the user confirmed the deletion.
    DeleteStation(String),
    Login,
    Logout,
    Upgrade,
    GenerateScript(String),
    /// Speak the given text, or the last generated script when empty.
    Speak(String),
    Shutdown,
}

pub struct ControllerHandle {
    pub cmd_tx: mpsc::UnboundedSender<UiCommand>,
    pub state_rx: watch::Receiver<ControllerState>,
    _thread: Option<std::thread::JoinHandle<()>>,
}

impl Drop for ControllerHandle {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(UiCommand::Shutdown);
        if let Some(t) = self._thread.take() {
            let _ = t.join();
        }
    }
}

fn empty_state() -> ControllerState {
    ControllerState {
        session: Coordinator::new(vec![], 0.0, false).snapshot(),
        stations: vec![],
        user: None,
        upgrading: false,
        media_title: None,
        notice: None,
        studio: StudioState::default(),
    }
}

pub fn start_controller() -> ControllerHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(empty_state());

    let thread = std::thread::spawn(move || {
        let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(e) => {
                warn!(error = ?e, "failed to start controller runtime");
                return;
            }
        };
        rt.block_on(async move {
            if let Err(e) = controller_main(cmd_rx, state_tx).await {
                warn!(error = ?e, "controller exited with error");
            }
        });
    });

    ControllerHandle {
        cmd_tx,
        state_rx,
        _thread: Some(thread),
    }
}

#[derive(Debug)]
enum InternalMsg {
    ScriptDone { seq: u64, res: std::result::Result<String, StudioError> },
    SpeechDone { seq: u64, res: std::result::Result<Vec<String>, StudioError> },
    UpgradeDone,
}

struct Controller {
    config: AppConfig,
    coordinator: Coordinator,
    mpv: MpvProcess,
    /// Load requests sent to mpv and not yet resolved, oldest first.
    in_flight: VecDeque<PlayToken>,
    /// Request whose file mpv currently has open.
    loaded: Option<PlayToken>,
    user: Option<User>,
    upgrading: bool,
    media_title: Option<String>,
    notice: Option<String>,
    studio: Arc<StudioClient>,
    studio_state: StudioState,
    script_seq: u64,
    speech_seq: u64,
    voice: VoicePlayer<Box<dyn VoiceOutput>>,
    persist_tx: mpsc::UnboundedSender<Persist>,
    internal_tx: mpsc::UnboundedSender<InternalMsg>,
    state_tx: watch::Sender<ControllerState>,
}

async fn controller_main(
    mut cmd_rx: mpsc::UnboundedReceiver<UiCommand>,
    state_tx: watch::Sender<ControllerState>,
) -> Result<()> {
    let cfg_path = config_path()?;
    let config = {
        let path = cfg_path.clone();
        tokio::task::spawn_blocking(move || AppConfig::load_from(&path))
            .await
            .context("Join config load task")?
            .context("Failed to load config")?
    };
    let store = LocalStore::new(config.data_dir()?);
    let (stations, user) = {
        let store = store.clone();
        tokio::task::spawn_blocking(move || -> Result<_> { Ok((store.load_stations()?, store.load_user()?)) })
            .await
            .context("Join store load task")??
    };
    info!(stations = stations.len(), logged_in = user.is_some(), "loaded local data");

    let mut coordinator = Coordinator::new(stations, config.volume, config.muted);
    if let Some(id) = config.last_station.as_deref() {
        if let Err(e) = coordinator.preselect(id) {
            debug!(error = %e, "last station no longer exists");
        }
    }

    let socket_path = mpv_socket_path()?;
    let (mpv, mut mpv_events) = MpvProcess::spawn(socket_path).await?;

    let studio = Arc::new(StudioClient::new(config.studio.clone()).context("Failed to build studio client")?);
    let voice = VoicePlayer::new(PcmFormat::mono(config.studio.sample_rate), open_voice_output());
    let (internal_tx, mut internal_rx) = mpsc::unbounded_channel::<InternalMsg>();
    let (persist_tx, writer) = spawn_writer(store, cfg_path);

    let mut ctl = Controller {
        config,
        coordinator,
        mpv,
        in_flight: VecDeque::new(),
        loaded: None,
        user,
        upgrading: false,
        media_title: None,
        notice: None,
        studio,
        studio_state: StudioState::default(),
        script_seq: 0,
        speech_seq: 0,
        voice,
        persist_tx,
        internal_tx,
        state_tx,
    };
    let gain = ctl.coordinator.effective_gain();
    ctl.voice.set_gain(gain);
    ctl.publish();

    loop {
        tokio::select! {
            Some(cmd) = cmd_rx.recv() => {
                if matches!(cmd, UiCommand::Shutdown) {
                    let _ = ctl.mpv.command(MpvCommand::Shutdown);
                    break;
                }
                ctl.handle_command(cmd);
                ctl.publish();
            }
            ev = mpv_events.recv() => {
                let Some(ev) = ev else {
                    ctl.notice = Some("mpv controller stopped".to_string());
                    ctl.publish();
                    break;
                };
                let crashed = matches!(ev, MpvEvent::Crashed(_));
                ctl.handle_mpv_event(ev);
                ctl.publish();
                if crashed {
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
            }
            Some(msg) = internal_rx.recv() => {
                ctl.handle_internal(msg);
                ctl.publish();
            }
        }
    }

    // Dropping the controller closes the writer queue; wait for it to flush.
    drop(ctl);
    writer.await.context("Join store writer")?;
    Ok(())
}

impl Controller {
    fn publish(&self) {
        let _ = self.state_tx.send(ControllerState {
            session: self.coordinator.snapshot(),
            stations: self.coordinator.stations().to_vec(),
            user: self.user.clone(),
            upgrading: self.upgrading,
            media_title: self.media_title.clone(),
            notice: self.notice.clone(),
            studio: self.studio_state.clone(),
        });
    }

    fn handle_command(&mut self, cmd: UiCommand) {
        self.notice = None;
        match cmd {
            UiCommand::SelectAndPlay(id) => match self.coordinator.select_and_play(&id) {
                Ok(actions) => {
                    self.media_title = None;
                    self.apply(actions);
                }
                Err(e) => self.notice = Some(e.to_string()),
            },
            UiCommand::TogglePlay => {
                let actions = self.coordinator.toggle_play();
                self.apply(actions);
            }
            UiCommand::SetVolume(level) => {
                let actions = self.coordinator.set_volume(level);
                self.apply(actions);
                self.config.volume = self.coordinator.volume();
                self.persist(Persist::Config(self.config.clone()));
            }
            UiCommand::SetMuted(muted) => {
                let actions = self.coordinator.set_muted(muted);
                self.apply(actions);
                self.config.muted = muted;
                self.persist(Persist::Config(self.config.clone()));
            }
            UiCommand::AddStation(form) => match self.coordinator.add_station(form) {
                Ok(st) => {
                    info!(id = %st.id, name = %st.name, "station added");
                    self.save_stations();
                }
                Err(e) => self.notice = Some(e.to_string()),
            },
            UiCommand::DeleteStation(id) => match self.coordinator.delete_station(&id) {
                Ok((removed, actions)) => {
                    info!(id = %removed.id, "station deleted");
                    if !actions.is_empty() {
                        self.media_title = None;
                    }
                    self.apply(actions);
                    self.save_stations();
                    if self.config.last_station.as_deref() == Some(id.as_str()) {
                        self.config.last_station = None;
                        self.persist(Persist::Config(self.config.clone()));
                    }
                }
                Err(e) => self.notice = Some(e.to_string()),
            },
            UiCommand::Login => {
                let user = self.user.clone().unwrap_or_else(User::demo);
                self.user = Some(user.clone());
                self.persist(Persist::User(Some(user)));
            }
            UiCommand::Logout => {
                self.user = None;
                self.upgrading = false;
                self.persist(Persist::User(None));
            }
            UiCommand::Upgrade => {
                if self.upgrading {
                    return;
                }
                if self.user.is_none() {
                    self.notice = Some("Log in before upgrading".to_string());
                    return;
                }
                self.upgrading = true;
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(PAYMENT_DELAY).await;
                    let _ = tx.send(InternalMsg::UpgradeDone);
                });
            }
            UiCommand::GenerateScript(prompt) => {
                self.script_seq += 1;
                self.studio_state.generating = true;
                self.studio_state.error = None;
                let seq = self.script_seq;
                let studio = self.studio.clone();
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let res = studio.generate_script(&prompt).await;
                    let _ = tx.send(InternalMsg::ScriptDone { seq, res });
                });
            }
            UiCommand::Speak(text) => {
                let text = if text.trim().is_empty() {
                    self.studio_state.script.clone().unwrap_or_default()
                } else {
                    text
                };
                self.speech_seq += 1;
                self.studio_state.synthesizing = true;
                self.studio_state.error = None;
                let seq = self.speech_seq;
                let studio = self.studio.clone();
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let res = studio.synthesize(&text).await;
                    let _ = tx.send(InternalMsg::SpeechDone { seq, res });
                });
            }
            UiCommand::Shutdown => {}
        }
    }

    fn apply(&mut self, actions: Vec<OutputAction>) {
        for action in actions {
            match action {
                OutputAction::Load { token, url } => {
                    info!(station = %token.station_id, %url, "loading stream");
                    let sent = self
                        .mpv
                        .command(MpvCommand::LoadUrl { url })
                        .and_then(|_| self.mpv.command(MpvCommand::SetPause(false)));
                    match sent {
                        Ok(()) => self.in_flight.push_back(token),
                        Err(e) => {
                            let (_, follow) = self
                                .coordinator
                                .start_completed(&token, Err(PlaybackError::Rejected(e.to_string())));
                            self.apply(follow);
                        }
                    }
                }
                OutputAction::Pause => self.send(MpvCommand::SetPause(true)),
                OutputAction::Resume => self.send(MpvCommand::SetPause(false)),
                // `loaded` stays set: mpv still reports end-file for the stopped source.
                OutputAction::Stop => self.send(MpvCommand::Stop),
                OutputAction::SetGain(gain) => {
                    self.send(MpvCommand::SetVolume(gain));
                    self.voice.set_gain(gain);
                }
            }
        }
    }

    fn send(&self, cmd: MpvCommand) {
        if let Err(e) = self.mpv.command(cmd) {
            warn!(error = %e, "mpv command dropped");
        }
    }

    fn resolve_start(&mut self, token: PlayToken, outcome: std::result::Result<(), PlaybackError>) {
        let ok = outcome.is_ok();
        let (res, follow) = self.coordinator.start_completed(&token, outcome);
        if res == StartResult::Applied && ok {
            self.config.last_station = Some(token.station_id.clone());
            self.persist(Persist::Config(self.config.clone()));
        }
        self.apply(follow);
    }

    fn handle_mpv_event(&mut self, ev: MpvEvent) {
        match ev {
            MpvEvent::Ready => {
                let gain = self.coordinator.effective_gain();
                self.send(MpvCommand::SetVolume(gain));
            }
            MpvEvent::FileLoaded => {
                let Some(token) = self.in_flight.pop_front() else {
                    debug!("file-loaded with no pending request");
                    return;
                };
                self.loaded = Some(token.clone());
                self.resolve_start(token, Ok(()));
            }
            MpvEvent::EndFile(reason) => {
                if let Some(token) = self.loaded.take() {
                    debug!(station = %token.station_id, ?reason, "stream ended");
                    self.coordinator.playback_ended(&token);
                    return;
                }
                let Some(token) = self.in_flight.pop_front() else {
                    return;
                };
                let err = match reason {
                    EndReason::Error(msg) => PlaybackError::Unreachable(msg),
                    other => PlaybackError::Rejected(format!("ended before start ({other:?})")),
                };
                self.resolve_start(token, Err(err));
            }
            MpvEvent::MediaTitle(t) => self.media_title = t,
            MpvEvent::Pause(p) => debug!(paused = p, "mpv pause changed"),
            MpvEvent::Crashed(e) => {
                warn!(error = %e, "mpv crashed/restarting");
                self.notice = Some(format!("mpv error: {e}"));
                if let Some(token) = self.loaded.take() {
                    self.coordinator.playback_ended(&token);
                }
                while let Some(token) = self.in_flight.pop_front() {
                    self.resolve_start(token, Err(PlaybackError::Rejected(e.clone())));
                }
            }
        }
    }

    fn handle_internal(&mut self, msg: InternalMsg) {
        match msg {
            InternalMsg::ScriptDone { seq, res } => {
                if seq != self.script_seq {
                    debug!(seq, "discarding superseded script result");
                    return;
                }
                self.studio_state.generating = false;
                match res {
                    Ok(script) => self.studio_state.script = Some(script),
                    Err(e) => self.studio_state.error = Some(e.to_string()),
                }
            }
            InternalMsg::SpeechDone { seq, res } => {
                if seq != self.speech_seq {
                    debug!(seq, "discarding superseded speech result");
                    return;
                }
                self.studio_state.synthesizing = false;
                match res {
                    Ok(chunks) => {
                        let scheduled = self.voice.push_all(&chunks);
                        self.studio_state.chunks_scheduled += scheduled;
                        self.studio_state.chunks_dropped = self.voice.dropped();
                    }
                    Err(e) => self.studio_state.error = Some(e.to_string()),
                }
            }
            InternalMsg::UpgradeDone => {
                if !self.upgrading {
                    return;
                }
                self.upgrading = false;
                if let Some(user) = self.user.as_mut() {
                    user.plan = Plan::Pro;
                    let user = user.clone();
                    info!("plan upgraded");
                    self.persist(Persist::User(Some(user)));
                }
            }
        }
    }

    fn save_stations(&self) {
        self.persist(Persist::Stations(self.coordinator.stations().to_vec()));
    }

    fn persist(&self, job: Persist) {
        if self.persist_tx.send(job).is_err() {
            warn!("store writer stopped, change not saved");
        }
    }
}

fn open_voice_output() -> Box<dyn VoiceOutput> {
    #[cfg(feature = "voice-output")]
    {
        match crate::voice::RodioOutput::try_default() {
            Ok(out) => return Box::new(out),
            Err(e) => warn!(error = ?e, "no audio device for voice playback"),
        }
    }
    Box::new(ClockOutput::new())
}

fn mpv_socket_path() -> Result<PathBuf> {
    let runtime = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);

    let dir = runtime.join("edradio");
    crate::config::ensure_private_dir(&dir)?;
    Ok(dir.join("mpv.sock"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StudioConfig;
    use crate::models::{seed_stations, StationStatus};
    use base64::Engine;
    use tempfile::TempDir;

    struct Harness {
        ctl: Controller,
        mpv_rx: mpsc::UnboundedReceiver<MpvCommand>,
        state_rx: watch::Receiver<ControllerState>,
        writer: tokio::task::JoinHandle<()>,
        dir: TempDir,
        _internal_rx: mpsc::UnboundedReceiver<InternalMsg>,
    }

    impl Harness {
        fn new(stations: Vec<Station>) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let (persist_tx, writer) =
                spawn_writer(LocalStore::new(dir.path().join("data")), dir.path().join("config.toml"));
            let (mpv, mpv_rx) = MpvProcess::detached();
            let (internal_tx, internal_rx) = mpsc::unbounded_channel();
            let (state_tx, state_rx) = watch::channel(empty_state());
            let config = AppConfig {
                studio: StudioConfig { mock: true, ..StudioConfig::default() },
                ..AppConfig::default()
            };
            let studio = Arc::new(StudioClient::new(config.studio.clone()).unwrap());
            let output: Box<dyn VoiceOutput> = Box::new(ClockOutput::new());
            let voice = VoicePlayer::new(PcmFormat::mono(24_000), output);

            let ctl = Controller {
                coordinator: Coordinator::new(stations, config.volume, false),
                config,
                mpv,
                in_flight: VecDeque::new(),
                loaded: None,
                user: None,
                upgrading: false,
                media_title: None,
                notice: None,
                studio,
                studio_state: StudioState::default(),
                script_seq: 0,
                speech_seq: 0,
                voice,
                persist_tx,
                internal_tx,
                state_tx,
            };
            Self {
                ctl,
                mpv_rx,
                state_rx,
                writer,
                dir,
                _internal_rx: internal_rx,
            }
        }

        fn sent(&mut self) -> Vec<MpvCommand> {
            let mut out = Vec::new();
            while let Ok(cmd) = self.mpv_rx.try_recv() {
                out.push(cmd);
            }
            out
        }

        fn session(&self) -> SessionSnapshot {
            self.ctl.coordinator.snapshot()
        }
    }

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

    fn active_id(session: &SessionSnapshot) -> Option<&str> {
        session.active.as_ref().map(|s| s.id.as_str())
    }

    #[tokio::test]
    async fn select_sends_load_and_unpause() {
        let mut h = Harness::new(vec![station("a")]);
        h.ctl.handle_command(UiCommand::SelectAndPlay("a".into()));
        assert_eq!(
            h.sent(),
            vec![
                MpvCommand::LoadUrl { url: "https://example.com/a".into() },
                MpvCommand::SetPause(false),
            ]
        );
        assert_eq!(h.ctl.in_flight.len(), 1);

        h.ctl.handle_mpv_event(MpvEvent::FileLoaded);
        assert!(h.ctl.in_flight.is_empty());
        assert_eq!(h.ctl.loaded.as_ref().map(|t| t.station_id.as_str()), Some("a"));
        assert!(h.session().playing);
        assert_eq!(h.ctl.config.last_station.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn delete_active_then_select_other_keeps_new_stream_playing() {
        let mut h = Harness::new(vec![station("a"), station("b")]);
        h.ctl.handle_command(UiCommand::SelectAndPlay("a".into()));
        h.ctl.handle_mpv_event(MpvEvent::FileLoaded);
        h.ctl.handle_command(UiCommand::DeleteStation("a".into()));
        h.ctl.handle_command(UiCommand::SelectAndPlay("b".into()));

        // mpv reports the stopped file only after the new load was queued.
        h.ctl.handle_mpv_event(MpvEvent::EndFile(EndReason::Stop));
        h.ctl.handle_mpv_event(MpvEvent::FileLoaded);

        let s = h.session();
        assert_eq!(active_id(&s), Some("b"));
        assert!(s.playing);
        assert_eq!(s.error, None);
        assert!(h.ctl.in_flight.is_empty());
        assert_eq!(h.ctl.loaded.as_ref().map(|t| t.station_id.as_str()), Some("b"));
    }

    #[tokio::test]
    async fn end_of_stream_stops_playing() {
        let mut h = Harness::new(vec![station("a")]);
        h.ctl.handle_command(UiCommand::SelectAndPlay("a".into()));
        h.ctl.handle_mpv_event(MpvEvent::FileLoaded);
        h.ctl.handle_mpv_event(MpvEvent::EndFile(EndReason::Eof));

        let s = h.session();
        assert_eq!(active_id(&s), Some("a"));
        assert!(!s.playing);
        assert!(h.ctl.loaded.is_none());
    }

    #[tokio::test]
    async fn superseded_load_failure_is_discarded() {
        let mut h = Harness::new(vec![station("a"), station("b")]);
        h.ctl.handle_command(UiCommand::SelectAndPlay("a".into()));
        h.ctl.handle_command(UiCommand::SelectAndPlay("b".into()));
        assert_eq!(h.ctl.in_flight.len(), 2);

        h.ctl.handle_mpv_event(MpvEvent::EndFile(EndReason::Error("connection refused".into())));
        let s = h.session();
        assert_eq!(active_id(&s), Some("b"));
        assert!(s.playing);
        assert_eq!(s.error, None);

        h.ctl.handle_mpv_event(MpvEvent::FileLoaded);
        assert!(h.session().playing);
        assert_eq!(h.ctl.config.last_station.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn unreachable_stream_reverts_playing() {
        let mut h = Harness::new(vec![station("a")]);
        h.ctl.handle_command(UiCommand::SelectAndPlay("a".into()));
        h.ctl.handle_mpv_event(MpvEvent::EndFile(EndReason::Error("loading failed".into())));

        let s = h.session();
        assert_eq!(active_id(&s), Some("a"));
        assert!(!s.playing);
        assert!(s.error.unwrap().contains("loading failed"));
        assert_eq!(h.ctl.config.last_station, None);
    }

    #[tokio::test]
    async fn crash_fails_pending_loads_and_ends_playback() {
        let mut h = Harness::new(vec![station("a"), station("b")]);
        h.ctl.handle_command(UiCommand::SelectAndPlay("a".into()));
        h.ctl.handle_mpv_event(MpvEvent::FileLoaded);
        h.ctl.handle_command(UiCommand::SelectAndPlay("b".into()));
        h.ctl.handle_mpv_event(MpvEvent::Crashed("socket closed".into()));

        let s = h.session();
        assert_eq!(active_id(&s), Some("b"));
        assert!(!s.playing);
        assert!(s.error.is_some());
        assert!(h.ctl.in_flight.is_empty());
        assert!(h.ctl.loaded.is_none());
        assert!(h.ctl.notice.as_deref().unwrap().contains("socket closed"));
    }

    #[tokio::test]
    async fn ready_reapplies_gain() {
        let mut h = Harness::new(vec![station("a")]);
        h.ctl.handle_command(UiCommand::SetVolume(0.4));
        h.sent();
        h.ctl.handle_mpv_event(MpvEvent::Ready);
        assert_eq!(h.sent(), vec![MpvCommand::SetVolume(0.4)]);

        h.ctl.handle_command(UiCommand::SetMuted(true));
        assert_eq!(h.sent(), vec![MpvCommand::SetVolume(0.0)]);
    }

    #[tokio::test]
    async fn delete_is_published_as_one_consistent_snapshot() {
        let mut h = Harness::new(vec![station("a"), station("b")]);
        h.ctl.handle_command(UiCommand::SelectAndPlay("a".into()));
        h.ctl.handle_mpv_event(MpvEvent::FileLoaded);
        h.ctl.publish();
        let _ = h.state_rx.borrow_and_update();
        h.sent();

        h.ctl.handle_command(UiCommand::DeleteStation("a".into()));
        assert!(!h.state_rx.has_changed().unwrap());
        assert_eq!(h.sent(), vec![MpvCommand::Stop]);

        h.ctl.publish();
        let state = h.state_rx.borrow_and_update().clone();
        assert!(state.session.active.is_none());
        assert!(!state.session.playing);
        assert_eq!(state.stations.len(), 1);
        assert_eq!(state.stations[0].id, "b");
        assert_eq!(h.ctl.config.last_station, None);
    }

    #[tokio::test]
    async fn back_to_back_mutations_persist_in_order() {
        let mut h = Harness::new(seed_stations());
        for n in 0..5 {
            h.ctl.handle_command(UiCommand::AddStation(NewStation {
                name: format!("Station {n}"),
                stream_url: format!("https://example.com/{n}"),
                ..NewStation::default()
            }));
        }
        h.ctl.handle_command(UiCommand::Login);
        h.ctl.handle_command(UiCommand::Logout);
        h.ctl.handle_command(UiCommand::SetVolume(0.3));

        let Harness { ctl, writer, dir, .. } = h;
        drop(ctl);
        writer.await.unwrap();

        let store = LocalStore::new(dir.path().join("data"));
        assert_eq!(store.load_stations().unwrap().len(), 6);
        assert!(store.load_user().unwrap().is_none());
        let cfg = AppConfig::load_from(&dir.path().join("config.toml")).unwrap();
        assert!((cfg.volume - 0.3).abs() < 1e-6);
    }

    #[tokio::test]
    async fn script_and_speech_results_are_tracked_separately() {
        let mut h = Harness::new(vec![]);
        h.ctl.handle_command(UiCommand::GenerateScript("jazz".into()));
        h.ctl.handle_command(UiCommand::Speak("hola".into()));
        assert!(h.ctl.studio_state.generating);
        assert!(h.ctl.studio_state.synthesizing);

        h.ctl.handle_internal(InternalMsg::ScriptDone { seq: 1, res: Ok("guion".into()) });
        assert_eq!(h.ctl.studio_state.script.as_deref(), Some("guion"));
        assert!(!h.ctl.studio_state.generating);
        assert!(h.ctl.studio_state.synthesizing);

        let chunk = base64::engine::general_purpose::STANDARD.encode(vec![0u8; 4800]);
        h.ctl.handle_internal(InternalMsg::SpeechDone { seq: 1, res: Ok(vec![chunk]) });
        assert_eq!(h.ctl.studio_state.chunks_scheduled, 1);
        assert!(!h.ctl.studio_state.synthesizing);
    }

    #[tokio::test]
    async fn superseded_script_result_is_ignored() {
        let mut h = Harness::new(vec![]);
        h.ctl.handle_command(UiCommand::GenerateScript("jazz".into()));
        h.ctl.handle_command(UiCommand::GenerateScript("rock".into()));

        h.ctl.handle_internal(InternalMsg::ScriptDone { seq: 1, res: Ok("old".into()) });
        assert_eq!(h.ctl.studio_state.script, None);
        assert!(h.ctl.studio_state.generating);

        h.ctl.handle_internal(InternalMsg::ScriptDone { seq: 2, res: Ok("new".into()) });
        assert_eq!(h.ctl.studio_state.script.as_deref(), Some("new"));
        assert!(!h.ctl.studio_state.generating);
    }

    #[tokio::test]
    async fn upgrade_needs_login_and_lands_as_pro() {
        let mut h = Harness::new(vec![]);
        h.ctl.handle_command(UiCommand::Upgrade);
        assert!(!h.ctl.upgrading);
        assert!(h.ctl.notice.is_some());

        h.ctl.handle_command(UiCommand::Login);
        h.ctl.handle_command(UiCommand::Upgrade);
        assert!(h.ctl.upgrading);
        h.ctl.handle_internal(InternalMsg::UpgradeDone);
        assert!(!h.ctl.upgrading);
        assert_eq!(h.ctl.user.as_ref().map(|u| u.plan), Some(Plan::Pro));
    }
}
