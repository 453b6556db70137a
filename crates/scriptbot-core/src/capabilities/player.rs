//! Playback state behind the `audio` and `media` modules. Both namespaces
//! hold the same [`Player`], so volume changes made through `audio` apply to
//! what `media` queued.

use std::{collections::VecDeque, sync::Arc};

use http::Uri;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;

pub const MAX_VOLUME: u8 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Track {
    pub url: String,
    pub title: String,
}

impl Track {
    fn from_url(raw: &str) -> Option<Self> {
        let uri: Uri = raw.trim().parse().ok()?;
        uri.scheme()?;
        let title = uri
            .path()
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .or_else(|| uri.host())
            .unwrap_or_default()
            .to_string();
        Some(Self {
            url: uri.to_string(),
            title,
        })
    }
}

#[derive(Debug)]
struct PlayerState {
    volume: u8,
    muted: bool,
    repeat: bool,
    shuffle: bool,
    playing: bool,
    position_ms: u64,
    current: Option<Track>,
    queue: VecDeque<Track>,
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            volume: 50,
            muted: false,
            repeat: false,
            shuffle: false,
            playing: false,
            position_ms: 0,
            current: None,
            queue: VecDeque::new(),
        }
    }
}

impl PlayerState {
    fn start(&mut self, track: Track) -> Track {
        self.current = Some(track.clone());
        self.playing = true;
        self.position_ms = 0;
        track
    }
}

#[derive(Debug, Default)]
pub struct Player {
    state: Mutex<PlayerState>,
}

impl Player {
    pub fn new() -> Self {
        Self::default()
    }
}

/// The `audio` module.
pub struct AudioNamespace {
    player: Arc<Player>,
}

impl AudioNamespace {
    pub(crate) fn new(player: Arc<Player>) -> Self {
        Self { player }
    }

    pub fn volume(&self) -> u8 {
        self.player.state.lock().volume
    }

    /// Returns false when `volume` is above [`MAX_VOLUME`].
    pub fn set_volume(&self, volume: u8) -> bool {
        if volume > MAX_VOLUME {
            return false;
        }
        self.player.state.lock().volume = volume;
        true
    }

    pub fn is_muted(&self) -> bool {
        self.player.state.lock().muted
    }

    pub fn set_mute(&self, muted: bool) {
        self.player.state.lock().muted = muted;
    }

    pub fn is_repeat(&self) -> bool {
        self.player.state.lock().repeat
    }

    pub fn set_repeat(&self, repeat: bool) {
        self.player.state.lock().repeat = repeat;
    }

    pub fn is_shuffle(&self) -> bool {
        self.player.state.lock().shuffle
    }

    pub fn set_shuffle(&self, shuffle: bool) {
        self.player.state.lock().shuffle = shuffle;
    }

    pub fn is_playing(&self) -> bool {
        self.player.state.lock().playing
    }

    /// Position within the current track in milliseconds.
    pub fn track_position(&self) -> u64 {
        self.player.state.lock().position_ms
    }

    /// Moves within the current track; false when nothing is loaded.
    pub fn seek(&self, position_ms: u64) -> bool {
        let mut state = self.player.state.lock();
        if state.current.is_none() {
            return false;
        }
        state.position_ms = position_ms;
        true
    }
}

/// The `media` module.
pub struct MediaNamespace {
    player: Arc<Player>,
}

impl MediaNamespace {
    pub(crate) fn new(player: Arc<Player>) -> Self {
        Self { player }
    }

    /// Starts `url` right away. Returns false for anything that is not an
    /// absolute URL.
    pub fn play_url(&self, url: &str) -> bool {
        let Some(track) = Track::from_url(url) else {
            return false;
        };
        self.player.state.lock().start(track);
        true
    }

    pub fn enqueue(&self, url: &str) -> bool {
        let Some(track) = Track::from_url(url) else {
            return false;
        };
        self.player.state.lock().queue.push_back(track);
        true
    }

    /// Advances to the next queued track, a random one in shuffle mode. With
    /// an empty queue, repeat restarts the current track and otherwise
    /// playback stops.
    pub fn play_next(&self) -> Option<Track> {
        let mut state = self.player.state.lock();
        let next = if state.shuffle && !state.queue.is_empty() {
            let index = rand::thread_rng().gen_range(0..state.queue.len());
            state.queue.remove(index)
        } else {
            state.queue.pop_front()
        };
        match next.or_else(|| state.current.clone().filter(|_| state.repeat)) {
            Some(track) => Some(state.start(track)),
            None => {
                state.playing = false;
                state.position_ms = 0;
                None
            }
        }
    }

    /// Returns whether anything was playing.
    pub fn stop(&self) -> bool {
        let mut state = self.player.state.lock();
        let was_playing = state.playing;
        state.playing = false;
        state.position_ms = 0;
        was_playing
    }

    pub fn queue(&self) -> Vec<Track> {
        self.player.state.lock().queue.iter().cloned().collect()
    }

    pub fn remove_from_queue(&self, index: usize) -> Option<Track> {
        self.player.state.lock().queue.remove(index)
    }

    pub fn clear_queue(&self) {
        self.player.state.lock().queue.clear();
    }

    pub fn current_track(&self) -> Option<Track> {
        self.player.state.lock().current.clone()
    }
}
