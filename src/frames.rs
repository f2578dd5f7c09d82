use serde_derive::Serialize;

/// Frame type tag for the temperature sensor reading.
pub const FRAME_TYPE_TEMP: u8 = 0x01;

/// One decoded frame from a Minew manufacturer-data payload.
///
/// Serialized with a `type` discriminant so subscribers see the same shape
/// the beacons' vendor tooling emits, e.g.
/// `{"type": "FrameTempSensor", "temp": 30.0}`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "FrameTempSensor")]
    TempSensor { temp: f32 },
}

/// Decodes the frames inside a manufacturer-specific-data payload.
///
/// The payload starts with a 2-byte company identifier (skipped, never
/// validated), followed by a sequence of frames: a length byte, a type byte,
/// then a type-specific payload. The length byte only drives cursor
/// advancement; each known type reads a fixed-width window. Malformed or
/// truncated input yields fewer frames, never an error, and no read goes out
/// of bounds.
///
/// Temperature values are the raw big-endian u16 divided by 100. The wire
/// format is unsigned, so a reading that would be negative comes out as a
/// large positive value instead.
pub fn decode(data: &[u8]) -> Vec<Frame> {
    let mut frames = Vec::new();

    if data.len() < 2 {
        return frames;
    }

    // Skip the company identifier.
    let mut cursor = 2;

    while cursor < data.len() {
        // Truncated header: discard the remainder.
        if cursor + 1 >= data.len() {
            break;
        }
        let frame_length = data[cursor] as usize;
        let frame_type = data[cursor + 1];

        if frame_type == FRAME_TYPE_TEMP {
            // Fixed 2-byte value window, regardless of the declared length.
            if cursor + 4 > data.len() {
                break;
            }
            let raw = u16::from_be_bytes([data[cursor + 2], data[cursor + 3]]);
            frames.push(Frame::TempSensor {
                temp: f32::from(raw) / 100.0,
            });
        }
        // Unknown frame types are skipped but still advance the cursor, so
        // future sensor types coexist with this parser.

        cursor += frame_length + 1;
    }

    frames
}
