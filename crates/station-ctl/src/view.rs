//! Text rendering of the replica: the icon line and the status block.

use station_proto::replica::StateReplica;

/// `▶ Track not found` / `⏸ Artist - Title`, plus a health badge when the
/// engine is loading or failed.
pub fn icon_line(replica: &StateReplica) -> String {
    let glyph = replica.playback().button_glyph();
    let badge = replica
        .state()
        .and_then(|s| s.engine.badge_label())
        .map(|b| format!(" [{}]", b))
        .unwrap_or_default();
    format!("{} {}{}", glyph, replica.track_display(), badge)
}

pub fn status_block(replica: &StateReplica) -> String {
    let Some(state) = replica.state() else {
        return "no state received".to_string();
    };
    let mut lines = vec![
        format!("station:  {}", state.station.name),
        format!("playback: {}", state.playback.label()),
        format!("track:    {}", state.track.display()),
        format!("volume:   {:.0}%", state.volume * 100.0),
        format!("focus:    {:?}", state.focus),
        format!("rev:      {}", state.rev),
    ];
    if let station_proto::protocol::EngineHealth::Failed(reason) = &state.engine {
        lines.push(format!("engine:   failed ({})", reason));
    }
    lines.join("\n")
}
