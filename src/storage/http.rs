//! read-only storage client over the HTTP REST surface
//!
//! mirrors the server in [`super::server`]: blobs and pins are fetched by
//! path, listings stream newline-delimited JSON documents. mutations
//! return [`Error::ReadOnly`].

use std::io::{BufRead, BufReader};

use reqwest::blocking::Client;
use reqwest::StatusCode;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::hash::{Pin, Ref, SizedRef};

use super::{
    BlobIter, BlobSource, BlobStorage, BlobStream, BlobWriter, PinIter, PinStorage, Storage,
};

pub const REF_HEADER: &str = "X-CAS-Ref";

/// client for a remote store served over HTTP
pub struct HttpClient {
    base: String,
    cli: Client,
}

impl HttpClient {
    /// create a client for a base address like `https://host/cas`
    pub fn new(addr: &str) -> HttpClient {
        HttpClient {
            base: addr.trim_end_matches('/').to_string(),
            cli: Client::new(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    fn blobs_url(&self) -> String {
        format!("{}/blobs/", self.base)
    }

    fn blob_url(&self, r: &Ref) -> String {
        format!("{}/blobs/{}", self.base, r)
    }

    fn pins_url(&self) -> String {
        format!("{}/pins/", self.base)
    }

    fn pin_url(&self, name: &str) -> String {
        format!("{}/pins/{}", self.base, name)
    }

    fn iterate_ndjson<T>(&self, cancel: &CancelToken, url: String) -> Box<dyn Iterator<Item = Result<T>>>
    where
        T: serde::de::DeserializeOwned + 'static,
    {
        let resp = match self.cli.get(&url).send() {
            Ok(resp) if resp.status() == StatusCode::OK => resp,
            Ok(resp) => {
                let status = resp.status().as_u16();
                return Box::new(std::iter::once(Err(Error::HttpStatus(status))));
            }
            Err(e) => return Box::new(std::iter::once(Err(e.into()))),
        };
        let cancel = cancel.clone();
        let lines = BufReader::new(resp).lines();
        Box::new(lines.filter_map(move |line| {
            if let Err(e) = cancel.err() {
                return Some(Err(e));
            }
            let line = match line {
                Ok(l) => l,
                Err(e) => return Some(Err(Error::from_io(e, "<http>"))),
            };
            if line.trim().is_empty() {
                return None;
            }
            Some(serde_json::from_str::<T>(&line).map_err(Error::from))
        }))
    }
}

impl BlobSource for HttpClient {
    fn stat_blob(&self, cancel: &CancelToken, r: &Ref) -> Result<u64> {
        cancel.err()?;
        if r.is_zero() {
            return Err(Error::InvalidRef);
        }
        let resp = self.cli.head(self.blob_url(r)).send()?;
        match resp.status() {
            StatusCode::OK => Ok(resp.content_length().unwrap_or(0)),
            StatusCode::NOT_FOUND => Err(Error::NotFound),
            status => Err(Error::HttpStatus(status.as_u16())),
        }
    }

    fn fetch_blob(&self, cancel: &CancelToken, r: &Ref) -> Result<BlobStream<'_>> {
        cancel.err()?;
        if r.is_zero() {
            return Err(Error::InvalidRef);
        }
        let resp = self.cli.get(self.blob_url(r)).send()?;
        match resp.status() {
            StatusCode::OK => {
                let size = resp.content_length().unwrap_or(0);
                Ok((Box::new(resp), size))
            }
            StatusCode::NOT_FOUND => Err(Error::NotFound),
            status => Err(Error::HttpStatus(status.as_u16())),
        }
    }

    fn iterate_blobs(&self, cancel: &CancelToken) -> BlobIter<'_> {
        self.iterate_ndjson::<SizedRef>(cancel, self.blobs_url())
    }
}

impl BlobStorage for HttpClient {
    fn begin_blob<'a>(&'a self, _cancel: &CancelToken) -> Result<Box<dyn BlobWriter + 'a>> {
        Err(Error::ReadOnly)
    }
}

impl PinStorage for HttpClient {
    fn set_pin(&self, _cancel: &CancelToken, _name: &str, _r: &Ref) -> Result<()> {
        Err(Error::ReadOnly)
    }

    fn delete_pin(&self, _cancel: &CancelToken, _name: &str) -> Result<()> {
        Err(Error::ReadOnly)
    }

    fn get_pin(&self, cancel: &CancelToken, name: &str) -> Result<Ref> {
        cancel.err()?;
        if name.contains(['/', '?', '&']) {
            return Err(Error::InvalidPinName(name.to_string()));
        }
        let resp = self.cli.head(self.pin_url(name)).send()?;
        match resp.status() {
            StatusCode::OK => {
                let raw = resp
                    .headers()
                    .get(REF_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("");
                Ref::parse(raw)
            }
            StatusCode::NOT_FOUND => Err(Error::NotFound),
            status => Err(Error::HttpStatus(status.as_u16())),
        }
    }

    fn iterate_pins(&self, cancel: &CancelToken) -> PinIter<'_> {
        self.iterate_ndjson::<Pin>(cancel, self.pins_url())
    }
}

impl Storage for HttpClient {}
