//! Dispatcher protocol items: initialization header, DYNT form atoms, and
//! synthesized login/error screens.

use crate::Error;

/// `etype` values that mark a DYNT item as a form-field atom worth
/// collecting as a credential candidate.
pub const FORM_ATOM_ETYPES: [u16; 6] = [121, 122, 123, 130, 131, 132];

/// A single DYNT form-atom item as decoded off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormAtom {
    pub etype: u16,
    pub invisible: bool,
    pub primary_text: Option<String>,
    pub secondary_text: Option<String>,
}

impl FormAtom {
    /// The text this atom contributes to a credential capture: the primary
    /// text if present, else the secondary, trimmed of surrounding
    /// whitespace.
    pub fn captured_text(&self) -> Option<String> {
        self.primary_text
            .as_deref()
            .or(self.secondary_text.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

/// A UI event source item, carried alongside DYNT atoms in an interaction
/// message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiEvent {
    FunctionKey { control: u8, data: u8 },
    MenuPos,
    Other,
}

impl UiEvent {
    pub fn classify(&self) -> &'static str {
        match self {
            UiEvent::FunctionKey { control: 10, data: 15 } => "log off",
            UiEvent::FunctionKey { control: 10, data: 0 } => "enter",
            UiEvent::MenuPos => "menu",
            _ => "other",
        }
    }
}

/// A decoded interaction message: the OK-code item (if any), a UI event (if
/// any), and any DYNT form atoms present, in wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InteractionMessage {
    pub ok_code: Option<String>,
    pub ui_event: Option<UiEvent>,
    pub atoms: Vec<FormAtom>,
}

/// Tag byte identifying an initialization payload, recognized only on a
/// connection's first message.
pub const INIT_TAG: u8 = 0x00;

/// The terminal identity carried by an initialization payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitRequest {
    pub terminal: String,
}

/// Decodes a message as an initialization payload: `0x00, u16 terminal_len,
/// terminal bytes`. Returns `None` if the sub-header tag doesn't match,
/// which the caller treats as "not an init message" rather than an error.
pub fn decode_init(payload: &[u8]) -> Option<InitRequest> {
    if payload.first() != Some(&INIT_TAG) {
        return None;
    }
    let (terminal, _) = read_string(payload, 1).ok()?;
    Some(InitRequest { terminal })
}

/// Message layout (tag-length-value sequence of item records). Tag bytes:
///
/// - `0x01` OK-code: `u16 len, len bytes utf8`
/// - `0x02` UI event, function-key: `u8 control, u8 data`
/// - `0x03` UI event, menu-pos: no payload
/// - `0x04` DYNT form atom: `u16 etype, u8 flags (bit0 = invisible),
///   u16 primary_len, primary bytes, u16 secondary_len, secondary bytes`
pub fn decode_interaction(payload: &[u8]) -> Result<InteractionMessage, Error> {
    let mut msg = InteractionMessage::default();
    let mut pos = 0usize;

    while pos < payload.len() {
        let tag = payload[pos];
        pos += 1;

        match tag {
            0x01 => {
                let (s, next) = read_string(payload, pos)?;
                msg.ok_code = Some(s);
                pos = next;
            }
            0x02 => {
                let control = *payload.get(pos).ok_or(Error::Truncated)?;
                let data = *payload.get(pos + 1).ok_or(Error::Truncated)?;
                msg.ui_event = Some(UiEvent::FunctionKey { control, data });
                pos += 2;
            }
            0x03 => {
                msg.ui_event = Some(UiEvent::MenuPos);
            }
            0x04 => {
                let etype = read_u16(payload, pos)?;
                pos += 2;
                let flags = *payload.get(pos).ok_or(Error::Truncated)?;
                pos += 1;
                let (primary, next) = read_opt_string(payload, pos)?;
                pos = next;
                let (secondary, next) = read_opt_string(payload, pos)?;
                pos = next;

                msg.atoms.push(FormAtom {
                    etype,
                    invisible: flags & 0x01 != 0,
                    primary_text: primary,
                    secondary_text: secondary,
                });
            }
            _ => return Err(Error::InvalidHeader),
        }
    }

    Ok(msg)
}

fn read_u16(buf: &[u8], pos: usize) -> Result<u16, Error> {
    let bytes = buf.get(pos..pos + 2).ok_or(Error::Truncated)?;
    Ok(u16::from_be_bytes(bytes.try_into()?))
}

fn read_string(buf: &[u8], pos: usize) -> Result<(String, usize), Error> {
    let len = read_u16(buf, pos)? as usize;
    let start = pos + 2;
    let bytes = buf.get(start..start + len).ok_or(Error::Truncated)?;
    Ok((std::str::from_utf8(bytes)?.to_string(), start + len))
}

fn read_opt_string(buf: &[u8], pos: usize) -> Result<(Option<String>, usize), Error> {
    let (s, next) = read_string(buf, pos)?;
    Ok((if s.is_empty() { None } else { Some(s) }, next))
}

/// Parameters for synthesizing the login screen sent after a successful
/// initialization.
#[derive(Debug, Clone)]
pub struct LoginScreenParams<'a> {
    pub hostname: &'a str,
    pub sid: &'a str,
    pub client_no: &'a str,
    pub session_title: &'a str,
    pub database_version: &'a str,
    pub kernel_version: &'a str,
    pub kernel_patch_level: &'a str,
    pub context_id: &'a str,
}

/// Builds the static login screen item sequence, parameterized by the
/// fields the spec names. There is only one reachable synthesis path; the
/// upstream's second branch is unreachable dead code and has no counterpart
/// here.
pub fn make_login_screen(params: &LoginScreenParams<'_>) -> Vec<u8> {
    let mut out = Vec::new();
    for field in [
        params.hostname,
        params.sid,
        params.client_no,
        params.session_title,
        params.database_version,
        params.kernel_version,
        params.kernel_patch_level,
        params.context_id,
    ] {
        push_item(&mut out, field);
    }
    out
}

fn push_item(out: &mut Vec<u8>, s: &str) {
    out.extend((s.len() as u16).to_be_bytes());
    out.extend(s.as_bytes());
}

const ERROR_MESSAGE: &str = "E: Unable to process your request, try later";

/// Builds the uncompressed error screen carrying the fixed message.
pub fn make_error_screen() -> Vec<u8> {
    let mut out = vec![0x00u8];
    push_item(&mut out, ERROR_MESSAGE);
    out
}

/// Builds the compressed error screen carrying the same fixed message, sent
/// after a credential-capture interaction.
pub fn make_compressed_error_screen() -> Vec<u8> {
    let mut out = vec![0x01u8];
    push_item(&mut out, ERROR_MESSAGE);
    out
}

/// Builds the terminal packet sent on log-off: end-of-processing and
/// end-of-connection flags set.
pub fn make_logoff_packet() -> Vec<u8> {
    vec![0xFEu8, 0b11]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captured_text_prefers_primary() {
        let atom = FormAtom {
            etype: 130,
            invisible: false,
            primary_text: Some("  user  ".into()),
            secondary_text: Some("fallback".into()),
        };
        assert_eq!(atom.captured_text().as_deref(), Some("user"));
    }

    #[test]
    fn captured_text_falls_back_to_secondary() {
        let atom = FormAtom {
            etype: 130,
            invisible: false,
            primary_text: None,
            secondary_text: Some("sec".into()),
        };
        assert_eq!(atom.captured_text().as_deref(), Some("sec"));
    }

    #[test]
    fn ui_event_classification() {
        assert_eq!(
            UiEvent::FunctionKey { control: 10, data: 15 }.classify(),
            "log off"
        );
        assert_eq!(
            UiEvent::FunctionKey { control: 10, data: 0 }.classify(),
            "enter"
        );
        assert_eq!(UiEvent::MenuPos.classify(), "menu");
        assert_eq!(UiEvent::FunctionKey { control: 1, data: 1 }.classify(), "other");
    }

    #[test]
    fn decode_init_recognizes_tag() {
        let mut payload = vec![INIT_TAG];
        payload.extend(2u16.to_be_bytes());
        payload.extend(b"t1");
        let init = decode_init(&payload).unwrap();
        assert_eq!(init.terminal, "t1");
    }

    #[test]
    fn decode_init_rejects_other_tags() {
        let payload = vec![0x01u8, 0x00, 0x00];
        assert!(decode_init(&payload).is_none());
    }

    #[test]
    fn decode_atom_roundtrip() {
        let mut payload = vec![0x04u8];
        payload.extend(130u16.to_be_bytes());
        payload.push(0x01); // invisible
        payload.extend(5u16.to_be_bytes());
        payload.extend(b"passw");
        payload.extend(0u16.to_be_bytes());

        let msg = decode_interaction(&payload).unwrap();
        assert_eq!(msg.atoms.len(), 1);
        assert!(msg.atoms[0].invisible);
        assert_eq!(msg.atoms[0].primary_text.as_deref(), Some("passw"));
    }
}
