//! Version profiles.
//!
//! Everything that varies across the three supported wire flavors lives
//! behind one tagged variant: which unidirectional streams exist, how
//! request-stream codecs are built, how GOAWAY travels, which peer streams
//! are acceptable, and how stream aborts interact with header compression.
//! The H3 profile privately owns the shared QPACK state.

use hqline_transport::{Role, UniStreamType};

use crate::codec::StreamCodec;
use crate::qpack::QpackState;
use crate::settings::HqSettings;

/// Negotiated protocol flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HqVersion {
    /// `h1q-fb`, `h1q`, `hq-27`: HTTP/1.1 on request streams, no control
    /// stream; drain rides on `Connection: close`.
    H1qUnframed,
    /// `h1q-fb-v2`: HTTP/1.1 on request streams plus one control stream
    /// carrying GOAWAY.
    H1qFramed,
    /// `h3-fb-05`, `h3-27`: HTTP/3 framing with QPACK.
    H3Framed,
}

pub enum VersionProfile {
    H3 { qpack: QpackState },
    H1Framed,
    H1Unframed,
}

impl VersionProfile {
    /// Select a profile from the negotiated application protocol.
    pub fn select(alpn: &str, egress_settings: &HqSettings) -> Option<(HqVersion, Self)> {
        match alpn {
            "h1q-fb" | "h1q" | "hq-27" => Some((HqVersion::H1qUnframed, VersionProfile::H1Unframed)),
            "h1q-fb-v2" => Some((HqVersion::H1qFramed, VersionProfile::H1Framed)),
            "h3-fb-05" | "h3-27" => Some((
                HqVersion::H3Framed,
                VersionProfile::H3 {
                    qpack: QpackState::new(egress_settings.qpack_max_table_capacity),
                },
            )),
            _ => None,
        }
    }

    /// The egress unidirectional streams this profile must create at setup.
    pub fn required_egress_streams(&self) -> &'static [UniStreamType] {
        match self {
            VersionProfile::H3 { .. } => &[
                UniStreamType::Control,
                UniStreamType::QpackEncoder,
                UniStreamType::QpackDecoder,
            ],
            VersionProfile::H1Framed => &[UniStreamType::H1qControl],
            VersionProfile::H1Unframed => &[],
        }
    }

    /// Interpret a unidirectional stream preface.
    pub fn parse_stream_preface(&self, preface: u64) -> Option<UniStreamType> {
        match self {
            VersionProfile::H3 { .. } => match preface {
                0x00 => Some(UniStreamType::Control),
                0x01 => Some(UniStreamType::Push),
                0x02 => Some(UniStreamType::QpackEncoder),
                0x03 => Some(UniStreamType::QpackDecoder),
                _ => None,
            },
            VersionProfile::H1Framed => match preface {
                p if p == UniStreamType::H1qControl.preface() => {
                    Some(UniStreamType::H1qControl)
                }
                _ => None,
            },
            // No unidirectional streams at all.
            VersionProfile::H1Unframed => None,
        }
    }

    /// Build the codec chain for a request (or push) stream.
    pub fn make_stream_codec(&self, role: Role, is_push: bool) -> StreamCodec {
        match self {
            VersionProfile::H3 { .. } => {
                // Only clients receive promises on request streams.
                StreamCodec::framed(role == Role::Client && !is_push)
            }
            VersionProfile::H1Framed | VersionProfile::H1Unframed => {
                // Push streams do not exist on the h1q flavors.
                StreamCodec::h1(role == Role::Server)
            }
        }
    }

    /// GOAWAY travels as a control-stream frame on the framed flavors.
    pub fn goaway_on_control_stream(&self) -> Option<UniStreamType> {
        match self {
            VersionProfile::H3 { .. } => Some(UniStreamType::Control),
            VersionProfile::H1Framed => Some(UniStreamType::H1qControl),
            VersionProfile::H1Unframed => None,
        }
    }

    /// Whether SETTINGS is exchanged on the control stream.
    pub fn sends_settings(&self) -> bool {
        matches!(self, VersionProfile::H3 { .. })
    }

    /// Whether peer-initiated unidirectional streams are acceptable at all.
    pub fn accepts_uni_streams(&self) -> bool {
        !matches!(self, VersionProfile::H1Unframed)
    }

    pub fn qpack(&mut self) -> Option<&mut QpackState> {
        match self {
            VersionProfile::H3 { qpack } => Some(qpack),
            _ => None,
        }
    }

    pub fn qpack_ref(&self) -> Option<&QpackState> {
        match self {
            VersionProfile::H3 { qpack } => Some(qpack),
            _ => None,
        }
    }

    /// Apply the peer's SETTINGS to profile-private state.
    pub fn apply_ingress_settings(&mut self, settings: &HqSettings) {
        if let VersionProfile::H3 { qpack } = self {
            // Our egress field sections are static-only; the peer's table
            // capacity bounds nothing we produce. Recorded for symmetry.
            let _ = qpack;
            let _ = settings;
        }
    }

    /// Stream abort hook: the H3 flavor must tell the peer's encoder the
    /// stream's header blocks will never be acknowledged.
    pub fn on_stream_abort(&mut self, stream_id: u64) {
        if let VersionProfile::H3 { qpack } = self {
            qpack.cancel_stream(stream_id);
        }
    }

    /// Post-read loop hook: drain QPACK decoder-stream instructions
    /// (Insert Count Increment, acks, cancellations) generated while
    /// processing reads.
    pub fn take_decoder_stream_bytes(&mut self) -> Option<Vec<u8>> {
        match self {
            VersionProfile::H3 { qpack } => qpack.take_decoder_stream_bytes(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpn_selection() {
        let settings = HqSettings::default();
        for alpn in ["h1q-fb", "h1q", "hq-27"] {
            let (version, _) = VersionProfile::select(alpn, &settings).unwrap();
            assert_eq!(version, HqVersion::H1qUnframed);
        }
        let (version, _) = VersionProfile::select("h1q-fb-v2", &settings).unwrap();
        assert_eq!(version, HqVersion::H1qFramed);
        for alpn in ["h3-fb-05", "h3-27"] {
            let (version, _) = VersionProfile::select(alpn, &settings).unwrap();
            assert_eq!(version, HqVersion::H3Framed);
        }
        assert!(VersionProfile::select("h2", &settings).is_none());
        assert!(VersionProfile::select("", &settings).is_none());
    }

    #[test]
    fn h3_required_streams() {
        let settings = HqSettings::default();
        let (_, profile) = VersionProfile::select("h3-27", &settings).unwrap();
        assert_eq!(
            profile.required_egress_streams(),
            &[
                UniStreamType::Control,
                UniStreamType::QpackEncoder,
                UniStreamType::QpackDecoder,
            ]
        );
        assert_eq!(
            profile.parse_stream_preface(0x01),
            Some(UniStreamType::Push)
        );
        assert_eq!(profile.parse_stream_preface(0x21), None);
    }

    #[test]
    fn h1q_profiles_have_no_qpack() {
        let settings = HqSettings::default();
        let (_, mut profile) = VersionProfile::select("h1q-fb-v2", &settings).unwrap();
        assert!(profile.qpack().is_none());
        assert!(!profile.sends_settings());
        assert_eq!(
            profile.goaway_on_control_stream(),
            Some(UniStreamType::H1qControl)
        );

        let (_, profile) = VersionProfile::select("h1q", &settings).unwrap();
        assert!(profile.goaway_on_control_stream().is_none());
        assert!(!profile.accepts_uni_streams());
    }
}
