// Playlist resolution: fetch and parse master/media M3U8 playlists and
// produce the ordered segment list with per-segment encryption metadata.

use crate::config::DownloaderConfig;
use crate::error::DownloadError;
use crate::task::{ByteRangeSpec, EncryptionSpec, Segment};
use bytes::Bytes;
use m3u8_rs::{MediaPlaylist, VariantStream, parse_playlist_res};
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

/// Variant stream chosen when the entry URL points at a master playlist.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum VariantSelectionPolicy {
    /// Select the variant with the highest bandwidth (default).
    #[default]
    HighestBandwidth,
    LowestBandwidth,
    /// Select the variant closest to the specified bitrate.
    ClosestToBandwidth(u64),
    MatchingResolution {
        width: u64,
        height: u64,
    },
}

#[derive(Debug, Clone)]
pub struct VariantInfo {
    pub url: String,
    pub bandwidth: u64,
    pub resolution: Option<(u64, u64)>,
    pub codecs: Option<String>,
}

/// Outcome of playlist resolution: everything the worker pool needs to
/// download a task, captured once so resume never re-fetches the playlist.
#[derive(Debug, Clone)]
pub struct ResolvedPlaylist {
    pub segments: Vec<Segment>,
    /// Present when the entry URL was a master playlist.
    pub variant: Option<VariantInfo>,
    pub media_playlist_url: String,
}

pub struct PlaylistResolver {
    client: reqwest::Client,
    config: Arc<DownloaderConfig>,
}

impl PlaylistResolver {
    pub fn new(client: reqwest::Client, config: Arc<DownloaderConfig>) -> Self {
        Self { client, config }
    }

    /// Fetch the playlist at `url_str`, follow a master playlist to the
    /// selected variant, and return the ordered segment list.
    ///
    /// Errors here are fatal for the task and are not retried at this
    /// layer; the scheduler decides whether to retry whole-task resolution.
    pub async fn resolve(&self, url_str: &str) -> Result<ResolvedPlaylist, DownloadError> {
        let playlist_url = Url::parse(url_str)
            .map_err(|e| DownloadError::invalid_url(url_str, e.to_string()))?;

        let body = self.fetch_playlist(&playlist_url).await?;
        match parse_playlist_res(&body) {
            Ok(m3u8_rs::Playlist::MasterPlaylist(master)) => {
                let variant = select_variant(&master.variants, &self.config.variant_policy)?;
                let media_url = playlist_url.join(&variant.uri).map_err(|e| {
                    DownloadError::PlaylistParse {
                        reason: format!(
                            "could not join master URL with variant URI {}: {e}",
                            variant.uri
                        ),
                    }
                })?;
                let info = VariantInfo {
                    url: media_url.to_string(),
                    bandwidth: variant.bandwidth,
                    resolution: variant.resolution.as_ref().map(|r| (r.width, r.height)),
                    codecs: variant.codecs.clone(),
                };
                debug!(url = %media_url, bandwidth = variant.bandwidth, "Selected variant stream");

                let media_body = self.fetch_playlist(&media_url).await?;
                let media_text = String::from_utf8_lossy(&media_body);
                match parse_playlist_res(&media_body) {
                    Ok(m3u8_rs::Playlist::MediaPlaylist(media)) => {
                        let segments = build_segments(&media, &media_url, &media_text)?;
                        Ok(ResolvedPlaylist {
                            segments,
                            variant: Some(info),
                            media_playlist_url: media_url.to_string(),
                        })
                    }
                    Ok(m3u8_rs::Playlist::MasterPlaylist(_)) => {
                        Err(DownloadError::PlaylistParse {
                            reason: "expected media playlist, got another master playlist"
                                .to_string(),
                        })
                    }
                    Err(e) => Err(DownloadError::PlaylistParse {
                        reason: format!("failed to parse media playlist: {e}"),
                    }),
                }
            }
            Ok(m3u8_rs::Playlist::MediaPlaylist(media)) => {
                let text = String::from_utf8_lossy(&body);
                let segments = build_segments(&media, &playlist_url, &text)?;
                Ok(ResolvedPlaylist {
                    segments,
                    variant: None,
                    media_playlist_url: playlist_url.to_string(),
                })
            }
            Err(e) => Err(DownloadError::PlaylistParse {
                reason: format!("failed to parse playlist: {e}"),
            }),
        }
    }

    async fn fetch_playlist(&self, url: &Url) -> Result<Bytes, DownloadError> {
        let response = self
            .client
            .get(url.clone())
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|e| DownloadError::playlist_fetch(url.as_str(), e.to_string()))?;
        if !response.status().is_success() {
            return Err(DownloadError::playlist_fetch(
                url.as_str(),
                format!("HTTP {}", response.status()),
            ));
        }
        response
            .bytes()
            .await
            .map_err(|e| DownloadError::playlist_fetch(url.as_str(), e.to_string()))
    }
}

fn select_variant<'a>(
    variants: &'a [VariantStream],
    policy: &VariantSelectionPolicy,
) -> Result<&'a VariantStream, DownloadError> {
    if variants.is_empty() {
        return Err(DownloadError::PlaylistParse {
            reason: "master playlist has no variants".to_string(),
        });
    }
    let selected = match policy {
        VariantSelectionPolicy::HighestBandwidth => {
            variants.iter().max_by_key(|v| v.bandwidth)
        }
        VariantSelectionPolicy::LowestBandwidth => variants.iter().min_by_key(|v| v.bandwidth),
        VariantSelectionPolicy::ClosestToBandwidth(target) => variants
            .iter()
            .min_by_key(|v| (*target as i64 - v.bandwidth as i64).abs()),
        VariantSelectionPolicy::MatchingResolution { width, height } => variants
            .iter()
            .find(|v| {
                v.resolution
                    .as_ref()
                    .is_some_and(|r| r.width == *width && r.height == *height)
            })
            .or_else(|| variants.iter().max_by_key(|v| v.bandwidth)),
    };
    selected.ok_or_else(|| DownloadError::PlaylistParse {
        reason: "no variant matched the selection policy".to_string(),
    })
}

/// Build the ordered segment list from a parsed media playlist.
///
/// Key association scans the manifest's `#EXT-X-KEY` tags directly: the
/// parser drops `METHOD=NONE` tags, so relying on the per-segment `key`
/// field would keep a stale AES key past a clearing tag. The active key is
/// carried forward from the most recent tag; `METHOD=NONE` clears it.
/// Segment URIs are resolved against the media playlist URL; sequence
/// numbers start at `EXT-X-MEDIA-SEQUENCE`.
pub(crate) fn build_segments(
    playlist: &MediaPlaylist,
    playlist_url: &Url,
    manifest: &str,
) -> Result<Vec<Segment>, DownloadError> {
    if !playlist.end_list {
        warn!(
            url = %playlist_url,
            "Media playlist has no EXT-X-ENDLIST; downloading the current snapshot"
        );
    }

    let key_changes = scan_key_tags(manifest, playlist_url)?;
    let mut changes = key_changes.iter().peekable();
    let mut current_key: Option<EncryptionSpec> = None;
    let mut segments = Vec::with_capacity(playlist.segments.len());

    for (offset, media_segment) in playlist.segments.iter().enumerate() {
        while let Some((at, spec)) = changes.peek() {
            if *at > offset {
                break;
            }
            current_key = spec.clone();
            changes.next();
        }

        let index = offset as u64;
        let mut segment = Segment::new(
            index,
            playlist.media_sequence + index,
            resolve_uri(playlist_url, &media_segment.uri)?,
        );
        if let Some(r) = &media_segment.byte_range {
            if r.length == 0 {
                return Err(DownloadError::PlaylistParse {
                    reason: format!("segment {index} has a zero-length EXT-X-BYTERANGE"),
                });
            }
            segment.byte_range = Some(ByteRangeSpec {
                length: r.length,
                offset: r.offset,
            });
        }
        segment.encryption = current_key.clone();
        segments.push(segment);
    }

    Ok(segments)
}

/// Scan the raw manifest for `#EXT-X-KEY` tags and return the key changes
/// in segment order: `(position, key)` means the key applies from the
/// segment at `position` onward.
fn scan_key_tags(
    manifest: &str,
    base: &Url,
) -> Result<Vec<(usize, Option<EncryptionSpec>)>, DownloadError> {
    let mut changes = Vec::new();
    let mut position = 0usize;
    for line in manifest.lines() {
        let line = line.trim();
        if let Some(attrs) = line.strip_prefix("#EXT-X-KEY:") {
            changes.push((position, parse_key_attributes(attrs, base)?));
        } else if !line.is_empty() && !line.starts_with('#') {
            // Segment URI line.
            position += 1;
        }
    }
    Ok(changes)
}

fn parse_key_attributes(
    attrs: &str,
    base: &Url,
) -> Result<Option<EncryptionSpec>, DownloadError> {
    let mut method = None;
    let mut uri = None;
    let mut iv = None;
    for (name, value) in split_attribute_list(attrs) {
        match name {
            "METHOD" => method = Some(value),
            "URI" => uri = Some(value.trim_matches('"')),
            "IV" => iv = Some(parse_iv_attribute(value)?),
            _ => {}
        }
    }
    match method {
        Some("NONE") => Ok(None),
        Some("AES-128") => {
            let uri = uri.ok_or_else(|| DownloadError::PlaylistParse {
                reason: "EXT-X-KEY with METHOD=AES-128 is missing URI".to_string(),
            })?;
            Ok(Some(EncryptionSpec {
                key_uri: resolve_uri(base, uri)?,
                iv,
            }))
        }
        Some(other) => Err(DownloadError::UnsupportedEncryption {
            method: other.to_string(),
        }),
        None => Err(DownloadError::PlaylistParse {
            reason: "EXT-X-KEY tag is missing METHOD".to_string(),
        }),
    }
}

/// Split an attribute list on commas outside quoted values.
fn split_attribute_list(attrs: &str) -> Vec<(&str, &str)> {
    let mut pairs = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, b) in attrs.bytes().enumerate() {
        match b {
            b'"' => in_quotes = !in_quotes,
            b',' if !in_quotes => {
                push_attribute(&mut pairs, &attrs[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    push_attribute(&mut pairs, &attrs[start..]);
    pairs
}

fn push_attribute<'a>(pairs: &mut Vec<(&'a str, &'a str)>, item: &'a str) {
    if let Some((name, value)) = item.split_once('=') {
        pairs.push((name.trim(), value.trim()));
    }
}

fn resolve_uri(base: &Url, uri: &str) -> Result<String, DownloadError> {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return Ok(uri.to_string());
    }
    base.join(uri)
        .map(|u| u.to_string())
        .map_err(|e| DownloadError::PlaylistParse {
            reason: format!("could not resolve URI `{uri}` against {base}: {e}"),
        })
}

/// Parse a playlist `IV=0x...` attribute into 16 bytes.
fn parse_iv_attribute(iv_hex: &str) -> Result<[u8; 16], DownloadError> {
    let trimmed = iv_hex.trim_start_matches("0x").trim_start_matches("0X");
    let mut iv = [0u8; 16];
    hex::decode_to_slice(trimmed, &mut iv).map_err(|e| DownloadError::PlaylistParse {
        reason: format!("failed to parse IV `{iv_hex}`: {e}"),
    })?;
    Ok(iv)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media_playlist(body: &str) -> MediaPlaylist {
        match parse_playlist_res(body.as_bytes()).expect("fixture must parse") {
            m3u8_rs::Playlist::MediaPlaylist(pl) => pl,
            m3u8_rs::Playlist::MasterPlaylist(_) => panic!("fixture is a master playlist"),
        }
    }

    fn segments_for(body: &str) -> Result<Vec<Segment>, DownloadError> {
        build_segments(&media_playlist(body), &base(), body)
    }

    fn base() -> Url {
        Url::parse("https://cdn.example.com/vod/main.m3u8").unwrap()
    }

    const ROTATING_KEYS: &str = "#EXTM3U\n\
#EXT-X-VERSION:3\n\
#EXT-X-TARGETDURATION:10\n\
#EXT-X-MEDIA-SEQUENCE:5\n\
#EXT-X-KEY:METHOD=AES-128,URI=\"key1.bin\"\n\
#EXTINF:9.0,\n\
seg0.ts\n\
#EXTINF:9.0,\n\
seg1.ts\n\
#EXT-X-KEY:METHOD=AES-128,URI=\"key2.bin\",IV=0x000102030405060708090a0b0c0d0e0f\n\
#EXTINF:9.0,\n\
seg2.ts\n\
#EXT-X-KEY:METHOD=NONE\n\
#EXTINF:9.0,\n\
seg3.ts\n\
#EXT-X-ENDLIST\n";

    #[test]
    fn key_carries_forward_and_none_clears() {
        let segments = segments_for(ROTATING_KEYS).unwrap();
        assert_eq!(segments.len(), 4);

        let k0 = segments[0].encryption.as_ref().unwrap();
        let k1 = segments[1].encryption.as_ref().unwrap();
        assert_eq!(k0.key_uri, "https://cdn.example.com/vod/key1.bin");
        // No key tag before seg1: key1 still applies.
        assert_eq!(k1.key_uri, k0.key_uri);
        assert!(k1.iv.is_none());

        let k2 = segments[2].encryption.as_ref().unwrap();
        assert_eq!(k2.key_uri, "https://cdn.example.com/vod/key2.bin");
        assert_eq!(
            k2.iv.unwrap(),
            [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]
        );

        assert!(segments[3].encryption.is_none());
    }

    #[test]
    fn method_none_boundary_survives_parser_key_dropping() {
        // The parser yields `key: None` for METHOD=NONE segments, so the
        // clearing boundary must come from the manifest scan: segments
        // after the tag carry no key, even with more AES segments later.
        let body = "#EXTM3U\n\
#EXT-X-VERSION:3\n\
#EXT-X-TARGETDURATION:10\n\
#EXT-X-KEY:METHOD=AES-128,URI=\"key1.bin\"\n\
#EXTINF:4.0,\n\
enc0.ts\n\
#EXT-X-KEY:METHOD=NONE\n\
#EXTINF:4.0,\n\
clear0.ts\n\
#EXTINF:4.0,\n\
clear1.ts\n\
#EXT-X-KEY:METHOD=AES-128,URI=\"key2.bin\"\n\
#EXTINF:4.0,\n\
enc1.ts\n\
#EXT-X-ENDLIST\n";
        let segments = segments_for(body).unwrap();
        assert!(segments[0].encryption.is_some());
        assert!(segments[1].encryption.is_none());
        assert!(segments[2].encryption.is_none());
        assert_eq!(
            segments[3].encryption.as_ref().unwrap().key_uri,
            "https://cdn.example.com/vod/key2.bin"
        );
    }

    #[test]
    fn key_uri_with_comma_inside_quotes() {
        let body = "#EXTM3U\n\
#EXT-X-VERSION:3\n\
#EXT-X-TARGETDURATION:10\n\
#EXT-X-KEY:METHOD=AES-128,URI=\"https://keys.example.com/k?ids=1,2\",IV=0x00000000000000000000000000000001\n\
#EXTINF:4.0,\n\
seg0.ts\n\
#EXT-X-ENDLIST\n";
        let segments = segments_for(body).unwrap();
        let k = segments[0].encryption.as_ref().unwrap();
        assert_eq!(k.key_uri, "https://keys.example.com/k?ids=1,2");
        assert_eq!(k.iv.unwrap()[15], 1);
    }

    #[test]
    fn sequence_numbers_start_at_media_sequence() {
        let segments = segments_for(ROTATING_KEYS).unwrap();
        let sequences: Vec<u64> = segments.iter().map(|s| s.sequence).collect();
        assert_eq!(sequences, vec![5, 6, 7, 8]);
        let indices: Vec<u64> = segments.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn absolute_segment_uris_pass_through() {
        let body = "#EXTM3U\n\
#EXT-X-VERSION:3\n\
#EXT-X-TARGETDURATION:10\n\
#EXTINF:4.0,\n\
https://other.example.net/abs/seg.ts\n\
#EXT-X-ENDLIST\n";
        let segments = segments_for(body).unwrap();
        assert_eq!(segments[0].url, "https://other.example.net/abs/seg.ts");
    }

    #[test]
    fn sample_aes_is_unsupported() {
        let body = "#EXTM3U\n\
#EXT-X-VERSION:5\n\
#EXT-X-TARGETDURATION:10\n\
#EXT-X-KEY:METHOD=SAMPLE-AES,URI=\"key.bin\"\n\
#EXTINF:4.0,\n\
seg0.ts\n\
#EXT-X-ENDLIST\n";
        let err = segments_for(body).unwrap_err();
        assert!(matches!(err, DownloadError::UnsupportedEncryption { .. }));
    }

    #[test]
    fn zero_length_byte_range_is_rejected() {
        let body = "#EXTM3U\n\
#EXT-X-VERSION:4\n\
#EXT-X-TARGETDURATION:10\n\
#EXT-X-BYTERANGE:0@0\n\
#EXTINF:4.0,\n\
seg0.ts\n\
#EXT-X-ENDLIST\n";
        let err = segments_for(body).unwrap_err();
        assert!(matches!(err, DownloadError::PlaylistParse { .. }));
    }

    #[test]
    fn empty_playlist_resolves_to_zero_segments() {
        let body = "#EXTM3U\n\
#EXT-X-VERSION:3\n\
#EXT-X-TARGETDURATION:10\n\
#EXT-X-ENDLIST\n";
        let segments = segments_for(body).unwrap();
        assert!(segments.is_empty());
    }

    #[test]
    fn variant_selection_policies() {
        let body = "#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360\n\
low/main.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=2400000,RESOLUTION=1280x720\n\
mid/main.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=6000000,RESOLUTION=1920x1080\n\
high/main.m3u8\n";
        let master = match parse_playlist_res(body.as_bytes()).unwrap() {
            m3u8_rs::Playlist::MasterPlaylist(pl) => pl,
            _ => panic!("fixture is not a master playlist"),
        };

        let v = select_variant(&master.variants, &VariantSelectionPolicy::HighestBandwidth).unwrap();
        assert_eq!(v.uri, "high/main.m3u8");

        let v = select_variant(&master.variants, &VariantSelectionPolicy::LowestBandwidth).unwrap();
        assert_eq!(v.uri, "low/main.m3u8");

        let v = select_variant(
            &master.variants,
            &VariantSelectionPolicy::ClosestToBandwidth(2_000_000),
        )
        .unwrap();
        assert_eq!(v.uri, "mid/main.m3u8");

        let v = select_variant(
            &master.variants,
            &VariantSelectionPolicy::MatchingResolution {
                width: 1280,
                height: 720,
            },
        )
        .unwrap();
        assert_eq!(v.uri, "mid/main.m3u8");
    }

    #[test]
    fn iv_attribute_parsing() {
        let iv = parse_iv_attribute("0x00000000000000000000000000000002").unwrap();
        assert_eq!(iv[15], 2);
        assert!(parse_iv_attribute("0xzz").is_err());
    }
}
