use std::{borrow::Cow, io};

use model::{ClientId, ClientUpdate, Layout, Mask, Metadata, ModelState, RoundId, Tensors};
use serde::de::DeserializeOwned;

use crate::{Deserialize, Serialize};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();

type MetaLen = u32;
const META_LEN_SIZE: usize = size_of::<MetaLen>();

const FLOAT_SIZE: usize = size_of::<f32>();

const ERR_H: Header = 0;
const CONTROL_H: Header = 1;
const TASK_H: Header = 2;
const RESULT_H: Header = 3;

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// First message of every client connection.
    Connect {
        client_id: ClientId,
        metadata: Metadata,
    },
    ConnectResponse {
        accepted: bool,
    },
    /// The session reached a terminal state, the client should stop waiting for tasks.
    SessionEnd,
    /// The client closes its connection gracefully.
    Disconnect,
}

/// A round's work order: the current model, pushed by the server.
#[derive(Debug)]
pub struct Task<'a> {
    pub round_id: RoundId,
    pub layout: Cow<'a, Layout>,
    pub values: &'a [f32],
}

impl<'a> Task<'a> {
    /// Creates a new `Task` borrowing the model.
    ///
    /// # Arguments
    /// * `round_id` - The round this task belongs to.
    /// * `model` - The model snapshot to broadcast.
    pub fn new(round_id: RoundId, model: &'a ModelState) -> Self {
        Self {
            round_id,
            layout: Cow::Borrowed(model.layout()),
            values: model.values(),
        }
    }

    /// Copies the received model out of the receive buffer.
    pub fn to_model(&self) -> io::Result<ModelState> {
        Tensors::new(self.layout.clone().into_owned(), self.values.to_vec()).map_err(invalid_data)
    }
}

/// A client's answer to a `Task`.
#[derive(Debug)]
pub struct RoundResult<'a> {
    pub round_id: RoundId,
    pub client_id: Cow<'a, ClientId>,
    pub layout: Cow<'a, Layout>,
    pub deltas: &'a [f32],
    pub mask_lens: Cow<'a, [usize]>,
    pub mask: &'a [f32],
}

impl<'a> RoundResult<'a> {
    /// Creates a new `RoundResult` borrowing the update.
    pub fn new(update: &'a ClientUpdate) -> Self {
        Self {
            round_id: update.round_id,
            client_id: Cow::Borrowed(&update.client_id),
            layout: Cow::Borrowed(update.deltas.layout()),
            deltas: update.deltas.values(),
            mask_lens: Cow::Borrowed(update.mask.lens()),
            mask: update.mask.values(),
        }
    }

    /// Copies the received update out of the receive buffer.
    pub fn to_update(&self) -> io::Result<ClientUpdate> {
        let deltas = Tensors::new(self.layout.clone().into_owned(), self.deltas.to_vec())
            .map_err(invalid_data)?;
        let mask =
            Mask::from_parts(self.mask_lens.to_vec(), self.mask.to_vec()).map_err(invalid_data)?;

        Ok(ClientUpdate {
            client_id: self.client_id.clone().into_owned(),
            round_id: self.round_id,
            deltas,
            mask,
        })
    }
}

/// The payload data for the `Data` variant of the `Msg` enum.
#[derive(Debug)]
pub enum Payload<'a> {
    Task(Task<'a>),
    Result(RoundResult<'a>),
}

/// The application layer message for the entire system.
#[derive(Debug)]
pub enum Msg<'a> {
    Control(Command),
    Data(Payload<'a>),
    Err(Cow<'a, str>),
}

impl Msg<'_> {
    /// A short name of the message kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Control(_) => "control",
            Msg::Data(Payload::Task(_)) => "data/task",
            Msg::Data(Payload::Result(_)) => "data/result",
            Msg::Err(_) => "err",
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct TaskMeta<'a> {
    round_id: RoundId,
    layout: Cow<'a, Layout>,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct ResultMeta<'a> {
    round_id: RoundId,
    client_id: Cow<'a, ClientId>,
    layout: Cow<'a, Layout>,
    mask_lens: Cow<'a, [usize]>,
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>> {
        match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&ERR_H.to_be_bytes());
                Ok(Some(e.as_bytes()))
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&CONTROL_H.to_be_bytes());
                serde_json::to_writer(&mut *buf, cmd)?;
                Ok(None)
            }
            Msg::Data(Payload::Task(task)) => {
                let meta = TaskMeta {
                    round_id: task.round_id,
                    layout: Cow::Borrowed(&task.layout),
                };

                write_meta(buf, TASK_H, &meta)?;
                Ok(Some(bytemuck::cast_slice(task.values)))
            }
            Msg::Data(Payload::Result(result)) => {
                let meta = ResultMeta {
                    round_id: result.round_id,
                    client_id: Cow::Borrowed(&result.client_id),
                    layout: Cow::Borrowed(&result.layout),
                    mask_lens: Cow::Borrowed(&result.mask_lens),
                };

                write_meta(buf, RESULT_H, &meta)?;
                buf.extend_from_slice(bytemuck::cast_slice(result.deltas));
                Ok(Some(bytemuck::cast_slice(result.mask)))
            }
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(invalid_data(format!(
                "the given buffer is too small {}, must at least be {HEADER_SIZE} bytes",
                buf.len()
            )));
        }

        let (kind_buf, rest) = buf.split_at(HEADER_SIZE);
        let kind = Header::from_be_bytes([kind_buf[0], kind_buf[1], kind_buf[2], kind_buf[3]]);

        match kind {
            ERR_H => {
                let text = std::str::from_utf8(rest).map_err(invalid_data)?;
                Ok(Self::Err(Cow::Borrowed(text)))
            }
            CONTROL_H => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Self::Control(cmd))
            }
            TASK_H => {
                let (meta, values): (TaskMeta, _) = read_meta(rest)?;

                if values.len() != meta.layout.len() {
                    return Err(invalid_data(format!(
                        "task for round {} carries {} values, its layout describes {}",
                        meta.round_id,
                        values.len(),
                        meta.layout.len()
                    )));
                }

                Ok(Self::Data(Payload::Task(Task {
                    round_id: meta.round_id,
                    layout: meta.layout,
                    values,
                })))
            }
            RESULT_H => {
                let (meta, values): (ResultMeta, _) = read_meta(rest)?;

                let deltas_len = meta.layout.len();
                let mask_len = meta
                    .mask_lens
                    .iter()
                    .fold(0usize, |acc, len| acc.saturating_add(*len));

                if values.len() != deltas_len.saturating_add(mask_len) {
                    return Err(invalid_data(format!(
                        "result of {} carries {} values, expected {deltas_len} deltas and {mask_len} mask entries",
                        meta.client_id,
                        values.len(),
                    )));
                }

                let (deltas, mask) = values.split_at(deltas_len);

                Ok(Self::Data(Payload::Result(RoundResult {
                    round_id: meta.round_id,
                    client_id: meta.client_id,
                    layout: meta.layout,
                    deltas,
                    mask_lens: meta.mask_lens,
                    mask,
                })))
            }
            byte => Err(invalid_data(format!("received an invalid kind header {byte}"))),
        }
    }
}

/// Writes the kind header, the length prefixed json `meta` and the padding
/// needed for the numbers that follow to be 4 bytes aligned.
///
/// Alignment is computed over the whole `buf`, so whatever precedes the
/// message in it must be a multiple of 4 bytes long.
fn write_meta<M: serde::Serialize>(buf: &mut Vec<u8>, kind: Header, meta: &M) -> io::Result<()> {
    buf.extend_from_slice(&kind.to_be_bytes());

    let len_at = buf.len();
    buf.extend_from_slice(&[0; META_LEN_SIZE]);
    serde_json::to_writer(&mut *buf, meta)?;

    let meta_len = buf.len() - len_at - META_LEN_SIZE;
    let meta_len = MetaLen::try_from(meta_len).map_err(invalid_data)?;
    buf[len_at..len_at + META_LEN_SIZE].copy_from_slice(&meta_len.to_be_bytes());

    let aligned = buf.len().next_multiple_of(FLOAT_SIZE);
    buf.resize(aligned, 0);
    Ok(())
}

/// Reads what `write_meta` wrote, `rest` starts right after the kind header.
///
/// # Returns
/// The decoded meta and the numbers following it.
fn read_meta<M: DeserializeOwned>(rest: &[u8]) -> io::Result<(M, &[f32])> {
    if rest.len() < META_LEN_SIZE {
        return Err(invalid_data("data message without meta length"));
    }

    let (len_buf, rest) = rest.split_at(META_LEN_SIZE);
    let meta_len = MetaLen::from_be_bytes([len_buf[0], len_buf[1], len_buf[2], len_buf[3]]) as usize;

    if rest.len() < meta_len {
        return Err(invalid_data(format!(
            "meta of {meta_len} bytes doesn't fit in the remaining {} bytes",
            rest.len()
        )));
    }

    let (meta_buf, rest) = rest.split_at(meta_len);
    let meta = serde_json::from_slice(meta_buf)?;

    let consumed = HEADER_SIZE + META_LEN_SIZE + meta_len;
    let padding = consumed.next_multiple_of(FLOAT_SIZE) - consumed;
    let numbers = rest
        .get(padding..)
        .ok_or_else(|| invalid_data("data message is missing its padding"))?;

    let values = bytemuck::try_cast_slice(numbers)
        .map_err(|e| invalid_data(format!("cannot view the numbers as f32: {e}")))?;

    Ok((meta, values))
}

fn invalid_data<E>(err: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Mimics the receive path: the message body starts on a 4 bytes aligned buffer.
    fn aligned(bytes: &[u8]) -> Vec<u32> {
        let mut words = vec![0u32; bytes.len().div_ceil(4)];
        bytemuck::cast_slice_mut::<u32, u8>(&mut words)[..bytes.len()].copy_from_slice(bytes);
        words
    }

    fn encode(msg: &Msg<'_>) -> Vec<u8> {
        let mut buf = Vec::new();
        let tail = msg.serialize(&mut buf).unwrap();
        buf.extend_from_slice(tail.unwrap_or_default());
        buf
    }

    #[test]
    fn task_keeps_shapes() {
        let model = Tensors::from_layers([(vec![2, 2], vec![1., 2., 3., 4.]), (vec![], vec![9.])])
            .unwrap();
        let bytes = encode(&Msg::Data(Payload::Task(Task::new(7, &model))));
        let words = aligned(&bytes);

        let msg = Msg::deserialize(&bytemuck::cast_slice::<u32, u8>(&words)[..bytes.len()]).unwrap();
        let Msg::Data(Payload::Task(task)) = msg else {
            panic!("unexpected message: {msg:?}");
        };

        assert_eq!(task.round_id, 7);
        assert_eq!(task.to_model().unwrap(), model);
    }

    #[test]
    fn result_splits_deltas_and_mask() {
        let deltas = Tensors::from_layers([(vec![3], vec![1., 2., 3.])]).unwrap();
        let update = ClientUpdate {
            client_id: "client-a".into(),
            round_id: 2,
            mask: Mask::from_layers([vec![1., 0., 1.]]),
            deltas,
        };

        let bytes = encode(&Msg::Data(Payload::Result(RoundResult::new(&update))));
        let words = aligned(&bytes);

        let msg = Msg::deserialize(&bytemuck::cast_slice::<u32, u8>(&words)[..bytes.len()]).unwrap();
        let Msg::Data(Payload::Result(result)) = msg else {
            panic!("unexpected message: {msg:?}");
        };

        assert_eq!(result.deltas, &[1., 2., 3.]);
        assert_eq!(result.mask, &[1., 0., 1.]);
        assert_eq!(result.to_update().unwrap(), update);
    }

    #[test]
    fn truncated_task_is_rejected() {
        let model = Tensors::zeros(Layout::new(vec![vec![4]]));
        let mut bytes = encode(&Msg::Data(Payload::Task(Task::new(0, &model))));
        bytes.truncate(bytes.len() - FLOAT_SIZE);
        let words = aligned(&bytes);

        let err = Msg::deserialize(&bytemuck::cast_slice::<u32, u8>(&words)[..bytes.len()]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let bytes = 42u32.to_be_bytes();
        assert!(Msg::deserialize(&bytes).is_err());
    }
}
