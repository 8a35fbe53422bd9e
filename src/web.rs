//! capturing web content into the store
//!
//! fetched bodies are stored as blobs and described by a
//! [`WebContent`] schema carrying the URL and the validators the server
//! sent. syncing re-fetches conditionally and only stores anything when
//! the content actually changed.

use chrono::{DateTime, Utc};
use reqwest::blocking::{Client, Response};
use reqwest::header;
use reqwest::StatusCode;
use url::Url;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::hash::{Ref, SizedRef};
use crate::schema::{Object, WebContent};
use crate::store::{Store, StoreConfig};

const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

fn parse_http_date(v: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(v)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// build the provenance record for a fetched response
///
/// `ts` mirrors `Last-Modified` when present; when the server sent neither
/// a validator nor a date the field stays empty so that refetches of
/// identical content deduplicate.
pub fn new_web_content(url: &str, resp_headers: &header::HeaderMap) -> WebContent {
    let etag = resp_headers
        .get(header::ETAG)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .trim_matches('"')
        .to_string();
    let ts = resp_headers
        .get(header::LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_http_date);
    WebContent {
        url: url.to_string(),
        r#ref: Ref::zero(),
        size: 0,
        etag,
        ts,
    }
}

impl Store {
    /// interpret an address as a URL or a local path and store the content
    pub fn store_addr(&self, cancel: &CancelToken, addr: &str, conf: &StoreConfig) -> Result<SizedRef> {
        if Url::parse(addr).is_ok() {
            return self.store_url_content(cancel, addr, conf);
        }
        if conf.index_only {
            self.index_file_path(cancel, addr.as_ref())
        } else {
            self.store_file_path(cancel, addr.as_ref())
        }
    }

    /// fetch a URL and record its body plus provenance
    pub fn store_url_content(
        &self,
        cancel: &CancelToken,
        url: &str,
        conf: &StoreConfig,
    ) -> Result<SizedRef> {
        cancel.err()?;
        let resp = Client::new().get(url).send()?;
        if resp.status() != StatusCode::OK {
            return Err(Error::HttpStatus(resp.status().as_u16()));
        }
        let mut m = new_web_content(url, resp.headers());
        let sr = self.store_response_body(cancel, resp, conf)?;
        m.r#ref = sr.r#ref;
        m.size = sr.size;
        self.store_schema(cancel, &Object::WebContent(m))
    }

    fn store_response_body(
        &self,
        cancel: &CancelToken,
        mut resp: Response,
        conf: &StoreConfig,
    ) -> Result<SizedRef> {
        let sr = self.store_blob(cancel, &mut resp, conf)?;
        if sr.r#ref.is_zero() {
            return Err(Error::InvalidRef);
        }
        Ok(sr)
    }

    /// bring a blob up to date with its origin
    ///
    /// only `cas:WebContent` blobs have an origin; anything else is already
    /// current by definition. returns the ref to use from now on: the old
    /// one when the origin is unchanged (304/412, matching validators or an
    /// identical body), a new `WebContent` schema ref otherwise.
    pub fn sync_blob(&self, cancel: &CancelToken, r: &Ref) -> Result<Ref> {
        let obj = match self.decode_schema(cancel, r) {
            Ok(obj) => obj,
            Err(Error::NotSchema) => return Ok(*r),
            Err(e) => return Err(e),
        };
        match obj {
            Object::WebContent(c) => self.sync_web_content(cancel, r, &c),
            _ => Ok(*r),
        }
    }

    fn sync_web_content(
        &self,
        cancel: &CancelToken,
        oref: &Ref,
        obj: &WebContent,
    ) -> Result<Ref> {
        cancel.err()?;
        let mut req = Client::new().get(&obj.url);
        if !obj.etag.is_empty() {
            req = req.header(header::IF_NONE_MATCH, format!("\"{}\"", obj.etag));
        }
        if let Some(ts) = &obj.ts {
            req = req.header(header::IF_MODIFIED_SINCE, ts.format(HTTP_DATE).to_string());
        }
        req = req.header("X-CAS-If-None-Match", obj.r#ref.to_string());

        let resp = req.send()?;
        match resp.status() {
            StatusCode::NOT_MODIFIED | StatusCode::PRECONDITION_FAILED => return Ok(*oref),
            StatusCode::OK => {}
            status => return Err(Error::HttpStatus(status.as_u16())),
        }
        if !obj.etag.is_empty() {
            let etag = resp
                .headers()
                .get(header::ETAG)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if etag == format!("\"{}\"", obj.etag) {
                return Ok(*oref);
            }
        }

        // a blob stored in index-only mode stays index-only on sync
        let mut conf = StoreConfig::default();
        if matches!(self.stat_blob(cancel, &obj.r#ref), Err(Error::NotFound)) {
            conf.index_only = true;
        }
        let mut m = new_web_content(&obj.url, resp.headers());
        let sr = self.store_response_body(cancel, resp, &conf)?;
        if sr.r#ref == obj.r#ref {
            return Ok(*oref);
        }
        m.r#ref = sr.r#ref;
        m.size = sr.size;
        Ok(self.store_schema(cancel, &Object::WebContent(m))?.r#ref)
    }
}
