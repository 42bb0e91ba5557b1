//! Media-server items → canonical media and episode records.
//!
//! Field derivations live here as small pure functions so they can be
//! tested on their own: quality tier from pixel width, tick conversions,
//! and the clamped progress percentage.

use serde_json::{json, Map, Value};

use crate::models::{
    CanonicalRecord, CatalogStatus, EpisodeRecord, MediaKind, MediaRecord, QualityTier, RawRecord,
    WatchState,
};
use crate::normalize::{flag, float, int, string_list, text, NormalizeContext, Normalized};

/// Media-server ticks per second (100ns units).
pub const TICKS_PER_SECOND: i64 = 10_000_000;
pub const TICKS_PER_MINUTE: i64 = 60 * TICKS_PER_SECOND;

/// At most this many actors are promoted to the top-level `actors` field.
const MAX_ACTORS: usize = 20;

pub fn quality_tier(width: i64) -> Option<QualityTier> {
    match width {
        w if w >= 3840 => Some(QualityTier::Uhd4k),
        w if w >= 1920 => Some(QualityTier::Fhd1080),
        w if w >= 1280 => Some(QualityTier::Hd720),
        w if w > 0 => Some(QualityTier::Sd),
        _ => None,
    }
}

pub fn ticks_to_seconds(ticks: i64) -> i64 {
    ticks / TICKS_PER_SECOND
}

pub fn ticks_to_minutes(ticks: i64) -> i64 {
    ticks / TICKS_PER_MINUTE
}

/// Playback position as a percentage of the runtime, clamped to
/// `[0, 100]` and rounded to two decimals. Zero when the runtime is
/// unknown.
pub fn progress_percent(position_ticks: i64, duration_ticks: i64) -> f64 {
    if duration_ticks <= 0 || position_ticks <= 0 {
        return 0.0;
    }
    let pct = (position_ticks as f64 / duration_ticks as f64 * 100.0).clamp(0.0, 100.0);
    (pct * 100.0).round() / 100.0
}

pub fn watch_state(played: bool, position_ticks: i64) -> WatchState {
    if played {
        WatchState::Watched
    } else if position_ticks > 0 {
        WatchState::InProgress
    } else {
        WatchState::Unwatched
    }
}

// ============ Stream details ============

/// Technical details of the first media source.
#[derive(Debug, Default)]
struct StreamInfo {
    size: Option<i64>,
    width: i64,
    video_codec: Option<String>,
    audio_codecs: Vec<String>,
    is_hd: Option<bool>,
    details: Value,
}

fn streams_of<'a>(streams: &'a [Value], kind: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
    streams
        .iter()
        .filter(move |s| s.get("Type").and_then(Value::as_str) == Some(kind))
}

fn stream_info(item: &RawRecord) -> StreamInfo {
    let Some(source) = item
        .get("MediaSources")
        .and_then(Value::as_array)
        .and_then(|s| s.first())
    else {
        return StreamInfo::default();
    };

    let streams: &[Value] = source
        .get("MediaStreams")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    let of_type = |kind: &'static str| streams_of(streams, kind);

    let empty = Value::Object(Map::new());
    let video = of_type("Video").next().unwrap_or(&empty);
    let width = int(video.get("Width")).unwrap_or(0);

    let audio: Vec<Value> = of_type("Audio")
        .map(|a| {
            json!({
                "codec": a.get("Codec"),
                "channels": a.get("Channels"),
                "sample_rate": a.get("SampleRate"),
                "bitrate": a.get("BitRate"),
                "language": a.get("Language"),
                "title": a.get("Title"),
                "is_default": a.get("IsDefault"),
            })
        })
        .collect();
    let subtitles: Vec<Value> = of_type("Subtitle")
        .map(|s| {
            json!({
                "language": s.get("Language"),
                "title": s.get("Title"),
                "codec": s.get("Codec"),
                "is_forced": s.get("IsForced"),
                "is_default": s.get("IsDefault"),
                "is_external": s.get("IsExternal"),
            })
        })
        .collect();

    let audio_codecs = of_type("Audio")
        .filter_map(|a| text(a.get("Codec")))
        .collect();
    let hdr = video
        .get("VideoDoViTitle")
        .filter(|v| !v.is_null())
        .or_else(|| video.get("VideoRangeType"));

    StreamInfo {
        size: int(source.get("Size")),
        width,
        video_codec: text(video.get("Codec")),
        audio_codecs,
        is_hd: flag(source.get("IsHD")),
        details: json!({
            "container": source.get("Container"),
            "bitrate": source.get("Bitrate"),
            "size": source.get("Size"),
            "video": {
                "codec": video.get("Codec"),
                "profile": video.get("Profile"),
                "level": video.get("Level"),
                "width": video.get("Width"),
                "height": video.get("Height"),
                "aspect_ratio": video.get("AspectRatio"),
                "bitrate": video.get("BitRate"),
                "framerate": video.get("RealFrameRate"),
                "bit_depth": video.get("BitDepth"),
                "color_space": video.get("ColorSpace"),
                "hdr": hdr,
                "is_interlaced": video.get("IsInterlaced"),
            },
            "audio": audio,
            "subtitles": subtitles,
        }),
    }
}

// ============ Shared item fields ============

fn names(list: Option<&Value>) -> Vec<Option<String>> {
    list.and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|i| match i {
                    Value::String(_) => text(Some(i)),
                    _ => text(i.get("Name")),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn image_url(base: Option<&str>, id: &str, kind: &str) -> Option<String> {
    base.map(|b| format!("{}/Items/{}/Images/{}", b.trim_end_matches('/'), id, kind))
}

struct UserData {
    played: bool,
    position_ticks: i64,
    play_count: i64,
    favorite: bool,
    last_played: Option<String>,
}

fn user_data(item: &RawRecord) -> UserData {
    let ud = item.get("UserData");
    let field = |k: &str| ud.and_then(|u| u.get(k));
    UserData {
        played: flag(field("Played")).unwrap_or(false),
        position_ticks: int(field("PlaybackPositionTicks")).unwrap_or(0).max(0),
        play_count: int(field("PlayCount")).unwrap_or(0).max(0),
        favorite: flag(field("IsFavorite")).unwrap_or(false),
        last_played: text(field("LastPlayedDate")),
    }
}

fn provider_id(item: &RawRecord, key: &str) -> Option<Value> {
    item.get("ProviderIds").and_then(|p| p.get(key)).cloned()
}

// ============ Movies and series ============

pub fn media(item: &RawRecord, ctx: &NormalizeContext) -> Normalized {
    let Some(id) = text(item.get("Id")) else {
        return Normalized::Skip("media item without Id".into());
    };
    let Some(title) = text(item.get("Name")) else {
        return Normalized::Skip(format!("media item {} has no title", id));
    };
    let media_type = match item.get("Type").and_then(Value::as_str) {
        Some("Movie") => MediaKind::Movie,
        Some("Series") => MediaKind::Series,
        other => {
            return Normalized::Skip(format!(
                "media item {} has unsupported type {:?}",
                id, other
            ))
        }
    };

    let streams = stream_info(item);
    let ud = user_data(item);
    let duration_ticks = int(item.get("RunTimeTicks")).unwrap_or(0);

    let genres = if item.get("GenreItems").is_some() {
        string_list(names(item.get("GenreItems")))
    } else {
        string_list(names(item.get("Genres")))
    };

    let mut actors = Vec::new();
    let mut directors = Vec::new();
    let mut writers = Vec::new();
    if let Some(people) = item.get("People").and_then(Value::as_array) {
        for person in people {
            let Some(name) = text(person.get("Name")) else {
                continue;
            };
            match person.get("Type").and_then(Value::as_str) {
                Some("Actor") if actors.len() < MAX_ACTORS => actors.push(name),
                Some("Director") => directors.push(name),
                Some("Writer") => writers.push(name),
                _ => {}
            }
        }
    }

    let studios: Vec<String> = names(item.get("Studios")).into_iter().flatten().collect();
    let taglines: Vec<String> = names(item.get("Taglines")).into_iter().flatten().collect();
    let trailers: Vec<String> = item
        .get("RemoteTrailers")
        .and_then(Value::as_array)
        .map(|t| t.iter().filter_map(|t| text(t.get("Url"))).collect())
        .unwrap_or_default();

    let base = ctx.media_server_url.as_deref();
    let image_tags = item.get("ImageTags");
    let has_tag = |k: &str| image_tags.and_then(|t| t.get(k)).is_some_and(|v| !v.is_null());
    let has_backdrop = item
        .get("BackdropImageTags")
        .and_then(Value::as_array)
        .is_some_and(|a| !a.is_empty());

    let is_4k = streams.width >= 3840;
    let is_hd = flag(item.get("IsHD"))
        .or(streams.is_hd)
        .unwrap_or(streams.width >= 1280);

    let audio = if streams.audio_codecs.is_empty() {
        None
    } else {
        Some(
            streams
                .audio_codecs
                .iter()
                .take(3)
                .cloned()
                .collect::<Vec<_>>()
                .join(", "),
        )
    };

    let metadata = json!({
        "streams": streams.details,
        "source": {
            "id": id,
            "etag": item.get("Etag"),
            "parent_id": item.get("ParentId"),
            "date_created": item.get("DateCreated"),
            "sort_name": item.get("SortName"),
            "has_subtitles": flag(item.get("HasSubtitles")).unwrap_or(false),
        },
        "crew": {
            "directors": directors,
            "writers": writers,
            "all_actors": actors,
        },
        "studios": studios,
        "tags": item.get("Tags").cloned().unwrap_or_else(|| json!([])),
        "all_taglines": taglines,
        "external_urls": item.get("ExternalUrls").cloned().unwrap_or_else(|| json!([])),
        "all_trailers": trailers,
        "has_local_trailer": flag(item.get("HasLocalTrailer")).unwrap_or(false),
        "provider_ids": item.get("ProviderIds").cloned().unwrap_or_else(|| json!({})),
        "user_data": {
            "play_count": ud.play_count,
            "is_favorite": ud.favorite,
            "played": ud.played,
            "playback_position_ticks": ud.position_ticks,
            "last_played_date": ud.last_played,
        },
    });

    Normalized::Record(CanonicalRecord::Media(MediaRecord {
        media_type,
        source_item_id: id.clone(),
        title,
        original_title: text(item.get("OriginalTitle")),
        year: int(item.get("ProductionYear")),
        imdb_id: text(provider_id(item, "Imdb").as_ref()),
        tmdb_id: int(provider_id(item, "Tmdb").as_ref()),
        tvdb_id: int(provider_id(item, "Tvdb").as_ref()),
        file_path: text(item.get("Path")),
        file_size: streams.size,
        duration_minutes: (duration_ticks > 0).then(|| ticks_to_minutes(duration_ticks)),
        quality: quality_tier(streams.width),
        is_hd,
        is_4k,
        codec: streams.video_codec,
        audio,
        overview: text(item.get("Overview")),
        genres,
        actors: string_list(actors.iter().cloned().map(Some)),
        director: (!directors.is_empty()).then(|| directors.join(", ")),
        studio: studios.first().cloned(),
        production_companies: string_list(studios.iter().cloned().map(Some)),
        poster_url: has_tag("Primary")
            .then(|| image_url(base, &id, "Primary"))
            .flatten(),
        backdrop_url: has_backdrop
            .then(|| image_url(base, &id, "Backdrop"))
            .flatten(),
        thumbnail_url: has_tag("Thumb")
            .then(|| image_url(base, &id, "Thumb"))
            .flatten(),
        status: CatalogStatus::Available,
        watch_state: watch_state(ud.played, ud.position_ticks),
        watched: ud.played,
        watched_at: if ud.played { ud.last_played.clone() } else { None },
        last_played_at: ud.last_played,
        watch_progress_seconds: ticks_to_seconds(ud.position_ticks),
        progress_percent: progress_percent(ud.position_ticks, duration_ticks),
        play_count: ud.play_count,
        favorite: ud.favorite,
        community_rating: float(item.get("CommunityRating")),
        critic_rating: float(item.get("CriticRating")),
        age_rating: text(item.get("OfficialRating")),
        tagline: taglines.first().cloned(),
        trailer_url: trailers.first().cloned(),
        release_date: text(item.get("PremiereDate"))
            .map(|d| d.split('T').next().unwrap_or_default().to_string()),
        source_added_at: text(item.get("DateCreated")),
        metadata,
        updated_at: ctx.now,
    }))
}

// ============ Episodes ============

pub fn episode(item: &RawRecord, ctx: &NormalizeContext) -> Normalized {
    let Some(id) = text(item.get("Id")) else {
        return Normalized::Skip("episode without Id".into());
    };
    let Some(title) = text(item.get("Name")) else {
        return Normalized::Skip(format!("episode {} has no title", id));
    };
    let Some(series_id) = text(item.get("SeriesId")) else {
        return Normalized::Skip(format!("episode {} has no series", id));
    };

    let streams = stream_info(item);
    let ud = user_data(item);
    let duration_ticks = int(item.get("RunTimeTicks")).unwrap_or(0);

    Normalized::Record(CanonicalRecord::Episode(EpisodeRecord {
        media_type: MediaKind::Episode,
        source_item_id: id,
        series_source_id: series_id,
        series_ref: None,
        title,
        season_number: int(item.get("ParentIndexNumber")),
        episode_number: int(item.get("IndexNumber")),
        imdb_id: text(provider_id(item, "Imdb").as_ref()),
        tmdb_id: int(provider_id(item, "Tmdb").as_ref()),
        tvdb_id: int(provider_id(item, "Tvdb").as_ref()),
        file_path: text(item.get("Path")),
        file_size: streams.size,
        duration_minutes: (duration_ticks > 0).then(|| ticks_to_minutes(duration_ticks)),
        quality: quality_tier(streams.width),
        overview: text(item.get("Overview")),
        status: CatalogStatus::Available,
        watch_state: watch_state(ud.played, ud.position_ticks),
        watched: ud.played,
        progress_percent: progress_percent(ud.position_ticks, duration_ticks),
        play_count: ud.play_count,
        updated_at: ctx.now,
    }))
}
