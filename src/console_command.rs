//! Line commands typed on the console and their translation to bus messages.

use crate::{
    playlist::HISTORY_PLAYLIST,
    protocol::{self, PlayMode, SearchRequest, SortKey},
    track::TrackRef,
};

pub const HELP: &str = "\
commands:
  search <term>             search Last.fm (prefix y: to search videos)
  related [n]               tracks similar to listed track n or the active track
  list                      show playlists
  show <playlist>           list a playlist's tracks
  history                   list recently played tracks
  play <n>                  play listed track n
  next | prev               skip forward or back
  mode [normal|shuffle|loop]
  new <playlist>            create a playlist
  delete <playlist>         remove a playlist
  clear <playlist>          empty a playlist
  add <playlist> <n>...     copy listed tracks into a playlist
  rm <n>...                 remove listed tracks
  dedupe                    remove duplicates from the listed playlist
  refresh [title] [thumb] <n>...
  sort <title|artist|album|channel|duration|playtime> [desc]
  pause                     toggle play/pause
  seek <secs|+secs|-secs|pct%>
  vol <0-100>
  quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seek {
    To(u64),
    By(i64),
    Percent(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Search(String),
    Related(Option<usize>),
    List,
    Show(String),
    Play(usize),
    Next,
    Previous,
    Mode(Option<PlayMode>),
    New(String),
    Delete(String),
    Clear(String),
    Add { playlist: String, indices: Vec<usize> },
    Remove(Vec<usize>),
    Dedupe,
    Refresh {
        title: bool,
        thumbnail: bool,
        indices: Vec<usize>,
    },
    Sort { key: SortKey, descending: bool },
    PlayPause,
    Seek(Seek),
    Volume(u8),
    Help,
    Quit,
}

/// What the console currently shows, used to resolve track numbers.
#[derive(Debug, Default, Clone)]
pub struct ConsoleState {
    pub listed: Option<(String, Vec<TrackRef>)>,
    pub active_track: Option<TrackRef>,
}

fn parse_indices(words: &[&str]) -> Result<Vec<usize>, String> {
    if words.is_empty() {
        return Err("expected one or more track numbers".to_string());
    }
    words
        .iter()
        .map(|word| {
            word.parse::<usize>()
                .map_err(|_| format!("{word:?} is not a track number"))
        })
        .collect()
}

fn required(rest: &str, what: &str) -> Result<String, String> {
    let rest = rest.trim();
    if rest.is_empty() {
        Err(format!("expected {what}"))
    } else {
        Ok(rest.to_string())
    }
}

fn parse_sort_key(word: &str) -> Option<SortKey> {
    match word {
        "title" => Some(SortKey::Title),
        "artist" => Some(SortKey::Artist),
        "album" => Some(SortKey::Album),
        "channel" => Some(SortKey::Channel),
        "duration" => Some(SortKey::Duration),
        "playtime" => Some(SortKey::PlayTime),
        _ => None,
    }
}

fn parse_seek(word: &str) -> Result<Seek, String> {
    let invalid = || format!("{word:?} is not a seek target");
    if let Some(percent) = word.strip_suffix('%') {
        let percent = percent.parse::<u8>().map_err(|_| invalid())?;
        return Ok(Seek::Percent(percent.min(100)));
    }
    if word.starts_with('+') || word.starts_with('-') {
        return word.parse::<i64>().map(Seek::By).map_err(|_| invalid());
    }
    word.parse::<u64>().map(Seek::To).map_err(|_| invalid())
}

pub fn parse_command(line: &str) -> Result<ConsoleCommand, String> {
    let line = line.trim();
    let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let words: Vec<&str> = rest.split_whitespace().collect();
    match verb {
        "search" | "s" => Ok(ConsoleCommand::Search(required(rest, "a search term")?)),
        "related" => match words.as_slice() {
            [] => Ok(ConsoleCommand::Related(None)),
            [index] => Ok(ConsoleCommand::Related(Some(parse_indices(&[*index])?[0]))),
            _ => Err("usage: related [n]".to_string()),
        },
        "list" | "ls" => Ok(ConsoleCommand::List),
        "show" => Ok(ConsoleCommand::Show(required(rest, "a playlist name")?)),
        "history" => Ok(ConsoleCommand::Show(HISTORY_PLAYLIST.to_string())),
        "play" | "p" => match words.as_slice() {
            [index] => Ok(ConsoleCommand::Play(parse_indices(&[*index])?[0])),
            _ => Err("usage: play <n>".to_string()),
        },
        "next" | "n" => Ok(ConsoleCommand::Next),
        "prev" => Ok(ConsoleCommand::Previous),
        "mode" => match words.as_slice() {
            [] => Ok(ConsoleCommand::Mode(None)),
            ["normal"] => Ok(ConsoleCommand::Mode(Some(PlayMode::Normal))),
            ["shuffle"] => Ok(ConsoleCommand::Mode(Some(PlayMode::Shuffle))),
            ["loop"] => Ok(ConsoleCommand::Mode(Some(PlayMode::Loop))),
            _ => Err("usage: mode [normal|shuffle|loop]".to_string()),
        },
        "new" => Ok(ConsoleCommand::New(required(rest, "a playlist name")?)),
        "delete" => Ok(ConsoleCommand::Delete(required(rest, "a playlist name")?)),
        "clear" => Ok(ConsoleCommand::Clear(required(rest, "a playlist name")?)),
        "add" => match words.split_first() {
            Some((playlist, indices)) => Ok(ConsoleCommand::Add {
                playlist: playlist.to_string(),
                indices: parse_indices(indices)?,
            }),
            None => Err("usage: add <playlist> <n>...".to_string()),
        },
        "rm" => Ok(ConsoleCommand::Remove(parse_indices(&words)?)),
        "dedupe" => Ok(ConsoleCommand::Dedupe),
        "refresh" => {
            let title = words.contains(&"title");
            let thumbnail = words.contains(&"thumb");
            let indices: Vec<&str> = words
                .iter()
                .copied()
                .filter(|word| *word != "title" && *word != "thumb")
                .collect();
            Ok(ConsoleCommand::Refresh {
                title,
                thumbnail,
                indices: parse_indices(&indices)?,
            })
        }
        "sort" => match words.as_slice() {
            [key] | [key, "asc"] => parse_sort_key(key)
                .map(|key| ConsoleCommand::Sort {
                    key,
                    descending: false,
                })
                .ok_or_else(|| format!("unknown sort key {key:?}")),
            [key, "desc"] => parse_sort_key(key)
                .map(|key| ConsoleCommand::Sort {
                    key,
                    descending: true,
                })
                .ok_or_else(|| format!("unknown sort key {key:?}")),
            _ => Err("usage: sort <key> [desc]".to_string()),
        },
        "pause" => Ok(ConsoleCommand::PlayPause),
        "seek" => match words.as_slice() {
            [target] => Ok(ConsoleCommand::Seek(parse_seek(target)?)),
            _ => Err("usage: seek <secs|+secs|-secs|pct%>".to_string()),
        },
        "vol" | "volume" => match words.as_slice() {
            [volume] => volume
                .parse::<u8>()
                .map(|volume| ConsoleCommand::Volume(volume.min(100)))
                .map_err(|_| format!("{volume:?} is not a volume")),
            _ => Err("usage: vol <0-100>".to_string()),
        },
        "help" | "?" => Ok(ConsoleCommand::Help),
        "quit" | "exit" | "q" => Ok(ConsoleCommand::Quit),
        other => Err(format!("unknown command {other:?}, try help")),
    }
}

impl ConsoleState {
    fn listed(&self) -> Result<(&str, &[TrackRef]), String> {
        self.listed
            .as_ref()
            .map(|(name, tracks)| (name.as_str(), tracks.as_slice()))
            .ok_or_else(|| "no playlist listed, use show <playlist> first".to_string())
    }

    fn listed_tracks(&self, indices: &[usize]) -> Result<Vec<TrackRef>, String> {
        let (_, tracks) = self.listed()?;
        indices
            .iter()
            .map(|index| {
                index
                    .checked_sub(1)
                    .and_then(|index| tracks.get(index))
                    .cloned()
                    .ok_or_else(|| format!("no track {index} in the listing"))
            })
            .collect()
    }
}

/// Bus messages carrying out `command`. Commands numbering tracks refer to
/// the current listing, counted from 1.
pub fn to_messages(
    command: ConsoleCommand,
    state: &ConsoleState,
) -> Result<Vec<protocol::Message>, String> {
    let playlist = |message| vec![protocol::Message::Playlist(message)];
    let playback = |message| vec![protocol::Message::Playback(message)];
    let messages = match command {
        ConsoleCommand::Search(term) => vec![protocol::Message::Search(
            protocol::SearchMessage::Request(SearchRequest::Term(term)),
        )],
        ConsoleCommand::Related(index) => {
            let track = match index {
                Some(index) => state.listed_tracks(&[index])?.remove(0),
                None => state
                    .active_track
                    .clone()
                    .ok_or_else(|| "nothing is playing".to_string())?,
            };
            vec![protocol::Message::Search(protocol::SearchMessage::Request(
                SearchRequest::RelatedTo(track),
            ))]
        }
        ConsoleCommand::List => playlist(protocol::PlaylistMessage::RequestOverview),
        ConsoleCommand::Show(name) => playlist(protocol::PlaylistMessage::RequestTracks { name }),
        ConsoleCommand::Play(index) => {
            let (name, tracks) = state.listed()?;
            if index == 0 || index > tracks.len() {
                return Err(format!("no track {index} in the listing"));
            }
            playlist(protocol::PlaylistMessage::ActivateTrackAt {
                name: name.to_string(),
                index: (index - 1) as isize,
            })
        }
        ConsoleCommand::Next => playlist(protocol::PlaylistMessage::ActivateNext { loop_other: true }),
        ConsoleCommand::Previous => {
            playlist(protocol::PlaylistMessage::ActivatePrevious { loop_other: true })
        }
        ConsoleCommand::Mode(Some(mode)) => playlist(protocol::PlaylistMessage::SetPlayMode(mode)),
        ConsoleCommand::Mode(None) => playlist(protocol::PlaylistMessage::CyclePlayMode),
        ConsoleCommand::New(name) => playlist(protocol::PlaylistMessage::CreatePlaylist { name }),
        ConsoleCommand::Delete(name) => playlist(protocol::PlaylistMessage::RemovePlaylist { name }),
        ConsoleCommand::Clear(name) => playlist(protocol::PlaylistMessage::ClearPlaylist { name }),
        ConsoleCommand::Add {
            playlist: name,
            indices,
        } => {
            let tracks = state
                .listed_tracks(&indices)?
                .iter()
                .map(|track| track.make_copy())
                .collect();
            playlist(protocol::PlaylistMessage::AddTracks { name, tracks })
        }
        ConsoleCommand::Remove(indices) => {
            let tracks = state.listed_tracks(&indices)?;
            let (name, _) = state.listed()?;
            playlist(protocol::PlaylistMessage::RemoveTracks {
                name: name.to_string(),
                tracks,
            })
        }
        ConsoleCommand::Dedupe => {
            let (name, tracks) = state.listed()?;
            playlist(protocol::PlaylistMessage::RemoveDuplicates {
                name: name.to_string(),
                tracks: tracks.to_vec(),
            })
        }
        ConsoleCommand::Refresh {
            title,
            thumbnail,
            indices,
        } => vec![protocol::Message::Enrichment(
            protocol::EnrichmentMessage::Refresh {
                tracks: state.listed_tracks(&indices)?,
                refresh_title: title,
                refresh_thumbnail: thumbnail,
            },
        )],
        ConsoleCommand::Sort { key, descending } => {
            let (name, _) = state.listed()?;
            playlist(protocol::PlaylistMessage::SortPlaylist {
                name: name.to_string(),
                key,
                descending,
            })
        }
        ConsoleCommand::PlayPause => playback(protocol::PlaybackMessage::PlayPause),
        ConsoleCommand::Seek(Seek::To(position)) => playback(protocol::PlaybackMessage::Seek(position)),
        ConsoleCommand::Seek(Seek::By(offset)) => playback(protocol::PlaybackMessage::SeekBy(offset)),
        ConsoleCommand::Seek(Seek::Percent(percent)) => {
            playback(protocol::PlaybackMessage::SeekPercent(percent))
        }
        ConsoleCommand::Volume(volume) => playback(protocol::PlaybackMessage::SetVolume(volume)),
        ConsoleCommand::Help | ConsoleCommand::Quit => Vec::new(),
    };
    Ok(messages)
}
