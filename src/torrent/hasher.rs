//! The piece-verification worker.
//!
//! One task per torrent. The request queue is sized to the piece count and
//! the coordinator never enqueues the same piece twice, so submission never
//! blocks. The worker exits when the request channel closes (torrent close)
//! or once every piece has verified.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::peer::StorageCtx;

#[derive(Debug, Clone, Copy)]
pub struct PieceHashed {
    pub piece: u32,
    pub ok: bool,
}

pub fn spawn_hasher(
    ctx: Arc<StorageCtx>,
    requests: mpsc::Receiver<u32>,
    results: mpsc::Sender<PieceHashed>,
) {
    tokio::spawn(run(ctx, requests, results));
}

async fn run(
    ctx: Arc<StorageCtx>,
    mut requests: mpsc::Receiver<u32>,
    results: mpsc::Sender<PieceHashed>,
) {
    let mut verified = 0;
    while let Some(piece) = requests.recv().await {
        let ok = ctx.storage.hash_piece(piece, ctx.piece_len(piece));
        if results.send(PieceHashed { piece, ok }).await.is_err() {
            return;
        }
        if ok {
            verified += 1;
            if verified == ctx.num_pieces {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::Builder;
    use crate::storage::MemoryStorage;
    use bytes::Bytes;

    fn ctx_for(content: Vec<u8>, piece_length: u64) -> Arc<StorageCtx> {
        let (mi, content) = Builder::new("x", piece_length)
            .file("x", content)
            .build();
        Arc::new(StorageCtx {
            storage: Arc::new(MemoryStorage::seeded(&mi.info, content)),
            piece_length: mi.info.piece_length,
            num_pieces: mi.info.num_pieces(),
            total_length: mi.info.total_length,
            raw_info: Bytes::new(),
        })
    }

    #[tokio::test]
    async fn verifies_queued_pieces() {
        let ctx = ctx_for(vec![5u8; 40], 16);
        let (req_tx, req_rx) = mpsc::channel(3);
        let (res_tx, mut res_rx) = mpsc::channel(3);
        spawn_hasher(ctx, req_rx, res_tx);

        for piece in 0..3 {
            req_tx.send(piece).await.unwrap();
        }
        for _ in 0..3 {
            let res = res_rx.recv().await.unwrap();
            assert!(res.ok);
        }
        // all pieces verified: the worker is gone and the channel closes
        assert!(res_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn reports_corrupt_piece() {
        let ctx = ctx_for(vec![5u8; 40], 16);
        ctx.storage.write_block(&[0xde, 0xad], 0).unwrap();
        let (req_tx, req_rx) = mpsc::channel(3);
        let (res_tx, mut res_rx) = mpsc::channel(3);
        spawn_hasher(ctx, req_rx, res_tx);

        req_tx.send(0).await.unwrap();
        req_tx.send(1).await.unwrap();
        let first = res_rx.recv().await.unwrap();
        assert!(!first.ok);
        let second = res_rx.recv().await.unwrap();
        assert!(second.ok);
    }

    #[tokio::test]
    async fn exits_when_requests_close() {
        let ctx = ctx_for(vec![5u8; 40], 16);
        let (req_tx, req_rx) = mpsc::channel(3);
        let (res_tx, mut res_rx) = mpsc::channel(3);
        spawn_hasher(ctx, req_rx, res_tx);
        drop(req_tx);
        assert!(res_rx.recv().await.is_none());
    }
}
