//! Line-oriented front end: one command per line on stdin, state changes on stdout.

use crate::controller::{ControllerHandle, ControllerState, UiCommand};
use crate::models::{NewStation, Plan};
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::io::IsTerminal;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

const HELP: &str = "\
commands:
  list                          show stations
  play <id>                     play / pause a station
  toggle                        play / pause the active station
  vol <0-100>                   set volume
  mute | unmute
  add <name>|<genre>|<url>|<description>|<cover>
  delete <id>                   remove a station (asks first)
  key <id>                      show / hide a stream key
  login | logout | upgrade
  script <topic>                write a radio script
  speak [text]                  voice the text or the last script
  quit";

#[derive(Debug, Clone, PartialEq)]
enum Input {
    Send(UiCommand),
    List,
    RevealKey(String),
    AskDelete(String),
    Help,
    Quit,
}

fn parse_line(line: &str) -> Result<Input, String> {
    let line = line.trim();
    let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    let need_arg = |what: &str| {
        if rest.is_empty() {
            Err(format!("usage: {word} <{what}>"))
        } else {
            Ok(rest.to_string())
        }
    };

    let input = match word {
        "list" | "ls" => Input::List,
        "play" => Input::Send(UiCommand::SelectAndPlay(need_arg("id")?)),
        "toggle" | "p" => Input::Send(UiCommand::TogglePlay),
        "vol" | "volume" => {
            let pct: f32 = need_arg("0-100")?
                .parse()
                .map_err(|_| "volume must be a number".to_string())?;
            Input::Send(UiCommand::SetVolume(pct / 100.0))
        }
        "mute" => Input::Send(UiCommand::SetMuted(true)),
        "unmute" => Input::Send(UiCommand::SetMuted(false)),
        "add" => {
            let raw = need_arg("name|genre|url|description|cover")?;
            let mut fields = raw.split('|').map(|f| f.trim().to_string());
            Input::Send(UiCommand::AddStation(NewStation {
                name: fields.next().unwrap_or_default(),
                genre: fields.next().unwrap_or_default(),
                stream_url: fields.next().unwrap_or_default(),
                description: fields.next().unwrap_or_default(),
                cover_image: fields.next().unwrap_or_default(),
            }))
        }
        "delete" | "rm" => Input::AskDelete(need_arg("id")?),
        "key" => Input::RevealKey(need_arg("id")?),
        "login" => Input::Send(UiCommand::Login),
        "logout" => Input::Send(UiCommand::Logout),
        "upgrade" => Input::Send(UiCommand::Upgrade),
        "script" => Input::Send(UiCommand::GenerateScript(need_arg("topic")?)),
        "speak" => Input::Send(UiCommand::Speak(rest.to_string())),
        "help" | "?" => Input::Help,
        "quit" | "exit" | "q" => Input::Quit,
        other => return Err(format!("unknown command: {other} (try help)")),
    };
    Ok(input)
}

fn status_line(state: &ControllerState) -> String {
    let s = &state.session;
    let mut line = match &s.active {
        Some(_) => format!(
            "[{}] {}  vol {:.0}%{}",
            if s.playing { "playing" } else { "paused" },
            state.label_text(),
            s.volume * 100.0,
            if s.muted { " (muted)" } else { "" }
        ),
        None => format!("[idle]  vol {:.0}%{}", s.volume * 100.0, if s.muted { " (muted)" } else { "" }),
    };
    if let Some(user) = &state.user {
        let plan = match user.plan {
            Plan::Free => "free",
            Plan::Pro => "pro",
        };
        line.push_str(&format!("  | {} ({plan}{})", user.name, if state.upgrading { ", processing" } else { "" }));
    }
    if let Some(e) = &s.error {
        line.push_str(&format!("\n  playback: {e}"));
    }
    if let Some(n) = &state.notice {
        line.push_str(&format!("\n  {n}"));
    }
    let studio = &state.studio;
    if studio.generating {
        line.push_str("\n  studio: writing script...");
    }
    if studio.synthesizing {
        line.push_str("\n  studio: synthesizing speech...");
    }
    if let Some(e) = &studio.error {
        line.push_str(&format!("\n  studio: {e}"));
    }
    line
}

fn station_list(state: &ControllerState, revealed: &HashSet<String>) -> String {
    if state.stations.is_empty() {
        return "no stations".to_string();
    }
    let active = state.session.active.as_ref().map(|s| s.id.as_str());
    state
        .stations
        .iter()
        .map(|s| {
            format!(
                "{} {:<10} {:<24} {:<20} {:>6} listeners  {}  key {}",
                if Some(s.id.as_str()) == active { "▶" } else { " " },
                s.id,
                s.name,
                s.genre,
                s.listeners,
                if s.is_live() { "LIVE" } else { "off " },
                s.display_key(revealed.contains(&s.id)),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn interactive() -> bool {
    std::io::stdin().is_terminal()
}

pub async fn run(handle: ControllerHandle) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut state_rx = handle.state_rx.clone();
    let mut revealed: HashSet<String> = HashSet::new();
    let mut pending_delete: Option<String> = None;
    let mut last_status = String::new();
    let mut last_script: Option<String> = None;
    let prompt = interactive();

    let mut out = String::from("EdRadio console, type help for commands\n");
    loop {
        if !out.is_empty() {
            if prompt {
                out.push_str("> ");
            }
            stdout.write_all(out.as_bytes()).await.context("Write to stdout")?;
            stdout.flush().await.context("Flush stdout")?;
            out.clear();
        }

        tokio::select! {
            changed = state_rx.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let state = state_rx.borrow_and_update().clone();
                let status = status_line(&state);
                if status != last_status {
                    out.push_str(&status);
                    out.push('\n');
                    last_status = status;
                }
                if state.studio.script != last_script {
                    if let Some(script) = &state.studio.script {
                        out.push_str(&format!("--- script ---\n{script}\n--------------\n"));
                    }
                    last_script = state.studio.script.clone();
                }
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Read stdin")? else {
                    return Ok(());
                };
                if line.trim().is_empty() {
                    continue;
                }
                if let Some(id) = pending_delete.take() {
                    if matches!(line.trim().to_lowercase().as_str(), "y" | "yes" | "s" | "si" | "sí") {
                        let _ = handle.cmd_tx.send(UiCommand::DeleteStation(id));
                    } else {
                        out.push_str("deletion cancelled\n");
                    }
                    continue;
                }
                match parse_line(&line) {
                    Ok(Input::Send(cmd)) => {
                        let _ = handle.cmd_tx.send(cmd);
                    }
                    Ok(Input::List) => {
                        out.push_str(&station_list(&state_rx.borrow(), &revealed));
                        out.push('\n');
                    }
                    Ok(Input::RevealKey(id)) => {
                        if !revealed.remove(&id) {
                            revealed.insert(id);
                        }
                        out.push_str(&station_list(&state_rx.borrow(), &revealed));
                        out.push('\n');
                    }
                    Ok(Input::AskDelete(id)) => {
                        let known = state_rx.borrow().stations.iter().any(|s| s.id == id);
                        if known {
                            out.push_str(&format!("delete station {id}? [y/N] "));
                            pending_delete = Some(id);
                        } else {
                            out.push_str(&format!("no station with id {id}\n"));
                        }
                    }
                    Ok(Input::Help) => {
                        out.push_str(HELP);
                        out.push('\n');
                    }
                    Ok(Input::Quit) => return Ok(()),
                    Err(msg) => {
                        out.push_str(&msg);
                        out.push('\n');
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::Coordinator;
    use crate::models::seed_stations;

    fn parse(line: &str) -> Input {
        parse_line(line).unwrap()
    }

    #[test]
    fn parses_playback_commands() {
        assert_eq!(parse("play st-01"), Input::Send(UiCommand::SelectAndPlay("st-01".into())));
        assert_eq!(parse("  toggle "), Input::Send(UiCommand::TogglePlay));
        assert_eq!(parse("vol 40"), Input::Send(UiCommand::SetVolume(0.4)));
        assert_eq!(parse("mute"), Input::Send(UiCommand::SetMuted(true)));
    }

    #[test]
    fn delete_goes_through_confirmation() {
        assert_eq!(parse("delete abc"), Input::AskDelete("abc".into()));
    }

    #[test]
    fn parses_add_form() {
        match parse("add Urban Beats | Urbano | https://s.example/live") {
            Input::Send(UiCommand::AddStation(form)) => {
                assert_eq!(form.name, "Urban Beats");
                assert_eq!(form.genre, "Urbano");
                assert_eq!(form.stream_url, "https://s.example/live");
                assert!(form.description.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn reports_usage_errors() {
        assert!(parse_line("play").unwrap_err().contains("usage"));
        assert!(parse_line("vol loud").is_err());
        assert!(parse_line("dance").unwrap_err().contains("unknown"));
    }

    #[test]
    fn speak_without_text_uses_last_script() {
        assert_eq!(parse("speak"), Input::Send(UiCommand::Speak(String::new())));
    }

    #[test]
    fn list_masks_keys_until_revealed() {
        let coordinator = Coordinator::new(seed_stations(), 0.5, false);
        let state = ControllerState {
            session: coordinator.snapshot(),
            stations: coordinator.stations().to_vec(),
            user: None,
            upgrading: false,
            media_title: None,
            notice: None,
            studio: Default::default(),
        };
        let mut revealed = HashSet::new();
        assert!(!station_list(&state, &revealed).contains("ed_live_main_9988"));
        revealed.insert("st-01".to_string());
        assert!(station_list(&state, &revealed).contains("ed_live_main_9988"));
        assert!(status_line(&state).starts_with("[idle]"));
    }
}
