//! # Peer Session
//!
//! A session is one outbound TCP conversation with one peer, used to
//! download one piece. The lifecycle is:
//!
//! 1. **Connect** (10-second deadline)
//! 2. **Handshake** (5-second deadline, protocol string and info-hash
//!    validated)
//! 3. **Initial message**: a bitfield is adopted as the peer's piece map;
//!    any other message is routed through the normal handler over an empty
//!    bitfield, so a `have` arriving first still registers
//! 4. **Availability gate**: the session fails early when the peer lacks
//!    the requested piece
//! 5. **Interest**, then the request/receive loop
//!
//! ## Pipelining
//!
//! Up to [`MAX_BACKLOG`] block requests are kept in flight while the peer
//! has us unchoked. Blocks are 16 KiB except the final one of a piece.
//! Reads wait up to 30 seconds for the next message (10 seconds while
//! choked, enough for an unchoke to arrive), and a whole piece gets a
//! 60-second budget from one peer before the session gives up.
//!
//! This client only downloads: `interested`, `not-interested`, `request`,
//! `cancel` and `port` from the remote are logged and ignored.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use byteorder::{BigEndian, ReadBytesExt};
use log::{debug, trace, warn};

use crate::bitfield::Bitfield;
use crate::handshake::{deserialize_handshake, Handshake, PROTOCOL_ID};
use crate::message::{self, Message, BLOCK_SIZE};
use crate::peer::Peer;

/// Number of block requests to keep pipelined.
pub const MAX_BACKLOG: u32 = 5;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const CHOKED_READ_TIMEOUT: Duration = Duration::from_secs(10);
const UNCHOKED_READ_TIMEOUT: Duration = Duration::from_secs(30);
const PIECE_TIMEOUT: Duration = Duration::from_secs(60);

/// A live connection to one remote peer.
pub struct PeerSession {
    peer: Peer,
    conn: TcpStream,
    remote_bitfield: Bitfield,
    remote_choked_us: bool,
    we_are_interested: bool,
}

impl PeerSession {
    /// Connects, handshakes and reads the peer's initial message.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or handshake times out, the peer
    /// answers for a different torrent, or the initial exchange is
    /// malformed. The connection is closed on every failure path.
    pub fn connect(
        peer: &Peer,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        num_pieces: usize,
    ) -> Result<PeerSession> {
        let addr = peer
            .addr()
            .to_socket_addrs()
            .with_context(|| format!("resolving peer {}", peer.addr()))?
            .next()
            .ok_or_else(|| anyhow!("peer {} did not resolve", peer.addr()))?;
        let conn = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .with_context(|| format!("connecting to peer {}", peer.addr()))?;

        let mut session = PeerSession {
            peer: peer.clone(),
            conn,
            remote_bitfield: Bitfield::with_capacity(num_pieces),
            remote_choked_us: true,
            we_are_interested: false,
        };

        session.handshake(info_hash, peer_id)?;
        session.receive_initial_message(num_pieces)?;

        Ok(session)
    }

    /// Returns whether the peer advertised piece `index`.
    pub fn has_piece(&self, index: usize) -> bool {
        self.remote_bitfield.has(index)
    }

    /// Downloads one piece, returning its assembled bytes.
    ///
    /// The buffer is complete when `piece_length` bytes have arrived; the
    /// caller still owns hash verification.
    pub fn download_piece(&mut self, index: usize, piece_length: u32) -> Result<Vec<u8>> {
        // Gate on availability before spending any protocol round-trips
        if !self.remote_bitfield.has(index) {
            return Err(anyhow!("peer {} does not have piece {index}", self.peer.addr()));
        }

        if !self.we_are_interested {
            self.send_message(&Message::new(message::MESSAGE_INTERESTED))?;
            self.we_are_interested = true;
        }

        let mut piece_buf = vec![0u8; piece_length as usize];
        let mut downloaded: u32 = 0;
        let mut requested: u32 = 0;
        let mut backlog: u32 = 0;
        let deadline = Instant::now() + PIECE_TIMEOUT;

        while downloaded < piece_length {
            if Instant::now() >= deadline {
                return Err(anyhow!(
                    "piece {index} timed out downloading from {}",
                    self.peer.addr()
                ));
            }

            // Keep the request pipeline full while unchoked
            if !self.remote_choked_us {
                while backlog < MAX_BACKLOG && requested < piece_length {
                    let block_size = BLOCK_SIZE.min(piece_length - requested);
                    self.send_message(&Message::request(index as u32, requested, block_size))?;
                    requested += block_size;
                    backlog += 1;
                    trace!(
                        "requested piece {index} [{}:{}] from {}",
                        requested - block_size,
                        requested,
                        self.peer.addr()
                    );
                }
            }

            let message = self.read_message()?;
            match message.id {
                message::MESSAGE_PIECE => {
                    let (piece_index, begin, data) = message::parse_piece(&message.payload)?;
                    if piece_index as usize != index {
                        debug!(
                            "ignoring block for piece {piece_index} while downloading {index} from {}",
                            self.peer.addr()
                        );
                        continue;
                    }
                    let end = begin as u64 + data.len() as u64;
                    if end > piece_length as u64 {
                        return Err(anyhow!(
                            "block [{begin}:{end}] exceeds piece length {piece_length}"
                        ));
                    }
                    piece_buf[begin as usize..end as usize].copy_from_slice(data);
                    downloaded += data.len() as u32;
                    backlog = backlog.saturating_sub(1);
                }
                _ => self.handle_message(message)?,
            }
        }

        debug!("downloaded piece {index} from {}", self.peer.addr());
        Ok(piece_buf)
    }

    /// Sends our handshake and validates the peer's reply.
    fn handshake(&mut self, info_hash: [u8; 20], peer_id: [u8; 20]) -> Result<()> {
        self.set_timeouts(HANDSHAKE_TIMEOUT)?;

        let handshake = Handshake::new(info_hash, peer_id);
        self.conn
            .write_all(&handshake.serialize())
            .with_context(|| format!("sending handshake to {}", self.peer.addr()))?;

        let mut pstrlen_buf = [0u8; 1];
        self.conn
            .read_exact(&mut pstrlen_buf)
            .with_context(|| format!("reading handshake from {}", self.peer.addr()))?;
        let pstrlen = pstrlen_buf[0] as usize;
        if pstrlen == 0 {
            return Err(anyhow!("peer {} sent an empty protocol string", self.peer.addr()));
        }

        let mut handshake_buf = vec![0u8; 48 + pstrlen];
        self.conn
            .read_exact(&mut handshake_buf)
            .with_context(|| format!("reading handshake from {}", self.peer.addr()))?;
        let reply = deserialize_handshake(&handshake_buf, pstrlen)?;

        if reply.pstr != PROTOCOL_ID.as_bytes() {
            return Err(anyhow!("peer {} speaks an unknown protocol", self.peer.addr()));
        }
        if reply.info_hash != info_hash {
            return Err(anyhow!("peer {} answered with a different info hash", self.peer.addr()));
        }

        Ok(())
    }

    /// Reads the first post-handshake message.
    ///
    /// A bitfield becomes the peer's piece map after a length check. Any
    /// other message goes through the normal handler; the peer then has an
    /// all-zero bitfield that later `have` messages fill in.
    fn receive_initial_message(&mut self, num_pieces: usize) -> Result<()> {
        self.set_timeouts(CHOKED_READ_TIMEOUT)?;
        let message = self.read_message()?;

        if message.id == message::MESSAGE_BITFIELD {
            if message.payload.len() != num_pieces.div_ceil(8) {
                return Err(anyhow!(
                    "peer {} sent a bitfield of {} bytes for {num_pieces} pieces",
                    self.peer.addr(),
                    message.payload.len()
                ));
            }
            self.remote_bitfield = Bitfield::new(message.payload);
            trace!("received bitfield from {}", self.peer.addr());
        } else {
            self.handle_message(message)?;
        }

        Ok(())
    }

    /// Handles every message type except blocks, which the download loop
    /// consumes directly.
    fn handle_message(&mut self, message: Message) -> Result<()> {
        match message.id {
            message::MESSAGE_KEEPALIVE => trace!("keep-alive from {}", self.peer.addr()),
            message::MESSAGE_CHOKE => {
                debug!("choked by {}", self.peer.addr());
                self.remote_choked_us = true;
            }
            message::MESSAGE_UNCHOKE => {
                debug!("unchoked by {}", self.peer.addr());
                self.remote_choked_us = false;
            }
            message::MESSAGE_HAVE => {
                let index = message::parse_have(&message.payload)?;
                self.remote_bitfield.set(index as usize);
            }
            message::MESSAGE_BITFIELD => {
                warn!("unexpected bitfield from {}", self.peer.addr());
            }
            message::MESSAGE_PIECE => {
                debug!("ignoring unsolicited block from {}", self.peer.addr());
            }
            message::MESSAGE_INTERESTED
            | message::MESSAGE_NOT_INTERESTED
            | message::MESSAGE_REQUEST
            | message::MESSAGE_CANCEL
            | message::MESSAGE_PORT => {
                // This client does not serve
                trace!("ignoring message {} from {}", message.id, self.peer.addr());
            }
            other => warn!("unknown message {other} from {}", self.peer.addr()),
        }
        Ok(())
    }

    /// Reads one length-prefixed message, honoring the choke-dependent
    /// deadline.
    fn read_message(&mut self) -> Result<Message> {
        let timeout = if self.remote_choked_us {
            CHOKED_READ_TIMEOUT
        } else {
            UNCHOKED_READ_TIMEOUT
        };
        self.conn.set_read_timeout(Some(timeout))?;

        let message_len = self
            .conn
            .read_u32::<BigEndian>()
            .with_context(|| format!("reading message length from {}", self.peer.addr()))?;
        if message_len == 0 {
            return Ok(Message::new(message::MESSAGE_KEEPALIVE));
        }

        let mut message_buf = vec![0u8; message_len as usize];
        self.conn
            .read_exact(&mut message_buf)
            .with_context(|| format!("reading message from {}", self.peer.addr()))?;
        message::deserialize_message(&message_buf)
    }

    fn send_message(&mut self, message: &Message) -> Result<()> {
        self.conn
            .write_all(&message.serialize())
            .with_context(|| format!("sending message {} to {}", message.id, self.peer.addr()))
    }

    fn set_timeouts(&self, timeout: Duration) -> Result<()> {
        self.conn.set_read_timeout(Some(timeout))?;
        self.conn.set_write_timeout(Some(timeout))?;
        Ok(())
    }
}
