// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use hyper::server::accept::Accept;
use hyper::server::conn::{AddrIncoming, AddrStream};

/// Adapts hyper's `AddrIncoming` acceptor into the connection `Stream` that
/// tonic's `serve_with_incoming_shutdown` expects.
pub struct AddrIncomingWithStream(pub AddrIncoming);

impl AddrIncomingWithStream {
    pub fn local_addr(&self) -> SocketAddr {
        self.0.local_addr()
    }
}

impl Stream for AddrIncomingWithStream {
    type Item = Result<AddrStream, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().0).poll_accept(cx)
    }
}
