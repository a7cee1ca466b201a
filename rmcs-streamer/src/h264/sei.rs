use super::emulation::encode_emulation_prevention;

const SEI_NAL_HEADER: u8 = 0x06;
const USER_DATA_UNREGISTERED_PAYLOAD_TYPE: u8 = 0x05;
const TIMESTAMP_PAYLOAD_SIZE: u8 = 0x08;
const RBSP_STOP_BIT: u8 = 0x80;

/// Builds a user-data-unregistered SEI NAL body carrying an 8-byte
/// big-endian wall-clock microsecond timestamp, per `spec.md` §3/§4.A.
/// Returns the NAL body only — no start code.
pub fn build_sei(timestamp_micros: u64) -> Vec<u8> {
    let mut payload = Vec::with_capacity(10);
    payload.push(USER_DATA_UNREGISTERED_PAYLOAD_TYPE);
    payload.push(TIMESTAMP_PAYLOAD_SIZE);
    payload.extend_from_slice(&timestamp_micros.to_be_bytes()[..8]);

    let mut body = Vec::with_capacity(payload.len() + 2);
    body.push(SEI_NAL_HEADER);
    body.extend_from_slice(&encode_emulation_prevention(&payload));
    body.push(RBSP_STOP_BIT);
    body
}
