//! Host half of the tile transfer protocol.
//!
//! A `TileReq` naming a drawable asks for that tile: the host answers with
//! `TileData` and waits for `TileAck`. The put sentinel announces that the
//! plug-in is pushing a tile back: the host answers with an empty header that
//! says whether shared memory is in use, reads the plug-in's `TileData`,
//! stores it and acknowledges.

use crate::drawable::{DrawableGeometry, DrawableStore};
use crate::process::PluginProcess;
use pixwire_wire::{
    Message, MessageRef, ProtocolError, SharedSegment, TileGrid, TileHeader, TileRect, TileReq,
    WireError,
};

pub(crate) struct TileService<'a> {
    process: &'a mut PluginProcess,
    drawables: &'a mut dyn DrawableStore,
    shm: Option<&'a SharedSegment>,
    tile_width: u32,
    tile_height: u32,
}

impl<'a> TileService<'a> {
    pub(crate) fn new(
        process: &'a mut PluginProcess,
        drawables: &'a mut dyn DrawableStore,
        shm: Option<&'a SharedSegment>,
        tile_width: u32,
        tile_height: u32,
    ) -> Self {
        let shm = shm.filter(|_| process.shm_attached());
        Self {
            process,
            drawables,
            shm,
            tile_width,
            tile_height,
        }
    }

    pub(crate) fn serve(&mut self, request: TileReq) -> Result<(), WireError> {
        if request.is_put() {
            self.receive()
        } else {
            self.send(request)
        }
    }

    fn locate(
        &self,
        drawable_id: i32,
        tile_num: u32,
    ) -> Result<(DrawableGeometry, TileRect), ProtocolError> {
        let geometry = self
            .drawables
            .geometry(drawable_id)
            .ok_or(ProtocolError::InvalidDrawable(drawable_id))?;
        let grid = TileGrid::new(
            geometry.width,
            geometry.height,
            self.tile_width,
            self.tile_height,
        );
        let rect = grid
            .tile_rect(tile_num)
            .ok_or(ProtocolError::InvalidTile {
                drawable_id,
                tile_num,
            })?;
        Ok((geometry, rect))
    }

    fn send(&mut self, request: TileReq) -> Result<(), WireError> {
        let (geometry, rect) = self.locate(request.drawable_id, request.tile_num)?;
        let pixels = self
            .drawables
            .read_rect(request.drawable_id, request.shadow, rect)?;
        let header = TileHeader {
            drawable_id: request.drawable_id,
            tile_num: request.tile_num,
            shadow: request.shadow,
            bpp: geometry.bpp,
            width: rect.width,
            height: rect.height,
            use_shm: self.shm.is_some(),
        };
        let inline = match self.shm {
            Some(segment) => {
                segment.store(&pixels)?;
                &[][..]
            }
            None => pixels.as_slice(),
        };
        self.process.send(MessageRef::TileData {
            header,
            data: inline,
        })?;
        match self.process.read()? {
            Message::TileAck => {
                tracing::trace!(
                    plugin = %self.process.id(),
                    drawable = request.drawable_id,
                    tile = request.tile_num,
                    "tile sent"
                );
                Ok(())
            }
            other => Err(ProtocolError::UnexpectedMessage {
                expected: "GP_TILE_ACK",
                received: other.message_type(),
            }
            .into()),
        }
    }

    fn receive(&mut self) -> Result<(), WireError> {
        let offer = TileHeader {
            use_shm: self.shm.is_some(),
            ..TileHeader::default()
        };
        self.process.send(MessageRef::TileData {
            header: offer,
            data: &[],
        })?;
        let tile = match self.process.read()? {
            Message::TileData(tile) => tile,
            other => {
                return Err(ProtocolError::UnexpectedMessage {
                    expected: "GP_TILE_DATA",
                    received: other.message_type(),
                }
                .into())
            }
        };

        let header = tile.header;
        let (geometry, rect) = self.locate(header.drawable_id, header.tile_num)?;
        for (field, expected, actual) in [
            ("width", rect.width, header.width),
            ("height", rect.height, header.height),
            ("bpp", geometry.bpp, header.bpp),
        ] {
            if expected != actual {
                return Err(ProtocolError::TileMismatch {
                    field,
                    expected: expected.into(),
                    actual: actual.into(),
                }
                .into());
            }
        }

        let data = if header.use_shm {
            let segment = self.shm.ok_or(ProtocolError::ShmUnavailable(-1))?;
            let mut data = vec![0u8; header.data_len()];
            segment.load(&mut data)?;
            data
        } else {
            tile.data
        };
        self.drawables
            .write_rect(header.drawable_id, header.shadow, rect, &data)?;
        self.process.send(MessageRef::TileAck)?;
        tracing::trace!(
            plugin = %self.process.id(),
            drawable = header.drawable_id,
            tile = header.tile_num,
            shadow = header.shadow,
            "tile stored"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drawable::MemoryDrawables;
    use crate::process::{OpenMode, PluginId, ThreadEntry, ThreadLauncher};
    use pixwire_wire::{read_message, send_message, TileData, Transport};
    use std::sync::{mpsc, Arc, Mutex};
    use std::time::Duration;

    type Script = Box<dyn FnOnce(&mut dyn Transport) + Send>;

    /// Opens a thread plug-in that runs `script` against its end of the channel.
    fn scripted(
        script: Script,
        shm: Option<&SharedSegment>,
    ) -> (PluginProcess, mpsc::Receiver<()>) {
        let script = Arc::new(Mutex::new(Some(script)));
        let (done_tx, done_rx) = mpsc::channel();
        let entry: ThreadEntry = Arc::new(move |_argv, mut transport, _shm| {
            if let Some(script) = script.lock().unwrap().take() {
                script(&mut transport);
            }
            let _ = done_tx.send(());
        });
        let mut launcher = ThreadLauncher::new(256 * 1024).with("scripted", entry);
        let mut process = PluginProcess::new(
            PluginId(1),
            "scripted".into(),
            vec!["scripted".into()],
            OpenMode::Run,
        );
        process.open(&mut launcher, shm).unwrap();
        (process, done_rx)
    }

    fn next_request(process: &mut PluginProcess) -> TileReq {
        match process.read().unwrap() {
            Message::TileReq(request) => request,
            other => panic!("expected a tile request, got {other:?}"),
        }
    }

    #[test]
    fn edge_tiles_are_cropped_and_acknowledged() {
        let mut drawables = MemoryDrawables::new();
        let pixels: Vec<u8> = (0..100 * 70).map(|v| (v % 251) as u8).collect();
        let id = drawables.insert(100, 70, 1, pixels).unwrap();

        let (mut process, done) = scripted(
            Box::new(move |transport| {
                let request = TileReq {
                    drawable_id: id,
                    tile_num: 3,
                    shadow: false,
                };
                send_message(transport, MessageRef::TileReq(request)).unwrap();
                let Message::TileData(tile) = read_message(transport).unwrap() else {
                    panic!("expected tile data");
                };
                // 100x70 in 64x64 tiles: tile 3 is the bottom-right 36x6 corner.
                assert_eq!((tile.header.width, tile.header.height), (36, 6));
                assert_eq!(tile.data.len(), 36 * 6);
                assert_eq!(tile.data[0], ((64 * 100 + 64) % 251) as u8);
                send_message(transport, MessageRef::TileAck).unwrap();
            }),
            None,
        );

        let request = next_request(&mut process);
        TileService::new(&mut process, &mut drawables, None, 64, 64)
            .serve(request)
            .unwrap();
        done.recv_timeout(Duration::from_secs(5)).unwrap();
        process.close(false, Duration::from_millis(10));
    }

    #[test]
    fn pushed_tiles_land_in_the_drawable() {
        let mut drawables = MemoryDrawables::new();
        let id = drawables.create(64, 64, 3);

        let (mut process, done) = scripted(
            Box::new(move |transport| {
                send_message(transport, MessageRef::TileReq(TileReq::put())).unwrap();
                let Message::TileData(offer) = read_message(transport).unwrap() else {
                    panic!("expected the put offer");
                };
                assert!(!offer.header.use_shm);
                assert_eq!(offer.header.data_len(), 0);
                let header = TileHeader {
                    drawable_id: id,
                    tile_num: 0,
                    shadow: true,
                    bpp: 3,
                    width: 64,
                    height: 64,
                    use_shm: false,
                };
                let data = vec![9u8; header.data_len()];
                send_message(transport, MessageRef::TileData { header, data: &data }).unwrap();
                assert!(matches!(read_message(transport).unwrap(), Message::TileAck));
            }),
            None,
        );

        let request = next_request(&mut process);
        TileService::new(&mut process, &mut drawables, None, 64, 64)
            .serve(request)
            .unwrap();
        done.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(drawables.shadow_pixels(id).unwrap().iter().all(|b| *b == 9));
        assert!(drawables.pixels(id).unwrap().iter().all(|b| *b == 0));
        process.close(false, Duration::from_millis(10));
    }

    #[test]
    fn shared_memory_carries_the_pixels() {
        let mut drawables = MemoryDrawables::new();
        let id = drawables.insert(8, 8, 1, vec![3; 64]).unwrap();
        let segment = SharedSegment::allocate(64 * 64 * 16);
        let peer = segment.clone();

        let (mut process, done) = scripted(
            Box::new(move |transport| {
                let request = TileReq {
                    drawable_id: id,
                    tile_num: 0,
                    shadow: false,
                };
                send_message(transport, MessageRef::TileReq(request)).unwrap();
                let Message::TileData(TileData { header, data }) = read_message(transport).unwrap()
                else {
                    panic!("expected tile data");
                };
                assert!(header.use_shm);
                assert!(data.is_empty());
                let mut pixels = [0u8; 64];
                peer.load(&mut pixels).unwrap();
                assert!(pixels.iter().all(|b| *b == 3));
                send_message(transport, MessageRef::TileAck).unwrap();
            }),
            Some(&segment),
        );

        let request = next_request(&mut process);
        TileService::new(&mut process, &mut drawables, Some(&segment), 64, 64)
            .serve(request)
            .unwrap();
        done.recv_timeout(Duration::from_secs(5)).unwrap();
        process.close(false, Duration::from_millis(10));
    }

    #[test]
    fn unknown_drawable_and_tile_are_violations() {
        let mut drawables = MemoryDrawables::new();
        let id = drawables.create(64, 64, 1);
        let (mut process, _done) = scripted(Box::new(|_transport| {}), None);

        let mut service = TileService::new(&mut process, &mut drawables, None, 64, 64);
        let missing = service.serve(TileReq {
            drawable_id: 77,
            tile_num: 0,
            shadow: false,
        });
        assert!(matches!(
            missing,
            Err(WireError::Protocol(ProtocolError::InvalidDrawable(77)))
        ));
        let outside = service.serve(TileReq {
            drawable_id: id,
            tile_num: 1,
            shadow: false,
        });
        assert!(matches!(
            outside,
            Err(WireError::Protocol(ProtocolError::InvalidTile { tile_num: 1, .. }))
        ));
        process.close(false, Duration::from_millis(10));
    }
}
