//! HTTP cache built on the store
//!
//! a [`CachedClient`] wraps a plain HTTP client and records every exchange
//! as three schema blobs: the request, the response and a session binding
//! the two. a later request that matches a stored one (same method, same
//! URL, same values for the configured match headers) is answered entirely
//! from the store, without touching the network. request bodies are
//! captured into blobs and replayed from there, so the wrapped transport
//! always sees a rewindable stream.

use std::io::{Cursor, Read};

use reqwest::blocking::{Body, Client};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::warn;
use url::Url;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::hash::{Ref, SizedRef};
use crate::schema::{self, Header, Object, Request, Response, Session};
use crate::store::{Store, StoreConfig};

/// header carrying the session ref on recorded and replayed responses
pub const SESSION_REF_HEADER: &str = "X-CAS-Session-Ref";

const PEEK_SIZE: usize = 4096;

/// an outgoing request
pub struct HttpRequest {
    pub method: String,
    pub url: Url,
    pub header: Header,
    pub body: Option<Box<dyn Read + Send>>,
}

impl HttpRequest {
    pub fn new(method: &str, url: Url) -> HttpRequest {
        HttpRequest {
            method: method.to_string(),
            url,
            header: Header::default(),
            body: None,
        }
    }

    pub fn get(url: &str) -> Result<HttpRequest> {
        let url = Url::parse(url).map_err(|e| Error::Config(e.to_string()))?;
        Ok(HttpRequest::new("GET", url))
    }
}

/// a response, either live or replayed from the store
pub struct HttpResponse<'a> {
    pub status: u16,
    pub header: Header,
    pub body: Box<dyn Read + Send + 'a>,
    /// set when the exchange was recorded or served from the store
    pub session_ref: Option<Ref>,
}

impl HttpResponse<'_> {
    /// drain the body into memory
    pub fn read_body(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.body
            .read_to_end(&mut out)
            .map_err(|e| Error::from_io(e, "<body>"))?;
        Ok(out)
    }
}

type RequestFilter = Box<dyn Fn(&HttpRequest) -> bool + Send + Sync>;
type ResponseFilter = Box<dyn Fn(u16, &Header) -> bool + Send + Sync>;

/// HTTP client that records exchanges and replays them from the store
pub struct CachedClient {
    s: Store,
    cli: Client,
    match_headers: Vec<String>,
    req_filter: Option<RequestFilter>,
    resp_filter: Option<ResponseFilter>,
}

impl CachedClient {
    pub fn new(s: Store) -> CachedClient {
        CachedClient {
            s,
            cli: Client::new(),
            match_headers: vec![
                "Accept".to_string(),
                "If-Modified-Since".to_string(),
                "If-None-Match".to_string(),
            ],
            req_filter: None,
            resp_filter: None,
        }
    }

    /// add headers that must agree for a request to match a cache entry
    pub fn match_headers(&mut self, list: &[&str]) {
        self.match_headers
            .extend(list.iter().map(|s| s.to_string()));
    }

    /// skip caching for requests the filter rejects
    pub fn request_filter(&mut self, f: RequestFilter) {
        self.req_filter = Some(f);
    }

    /// skip recording for responses the filter rejects
    pub fn response_filter(&mut self, f: ResponseFilter) {
        self.resp_filter = Some(f);
    }

    pub fn get(&self, cancel: &CancelToken, url: &str) -> Result<HttpResponse<'_>> {
        self.execute(cancel, HttpRequest::get(url)?)
    }

    /// send a request, answering from the store when possible
    pub fn execute(&self, cancel: &CancelToken, mut req: HttpRequest) -> Result<HttpResponse<'_>> {
        if let Some(f) = &self.req_filter {
            if !f(&req) {
                return self.forward_uncached(req);
            }
        }

        // capture the body first; matching never inspects it, but a replayed
        // request needs a rewindable stream
        let body = req.body.take();
        let bref = self.store_body(cancel, body)?;

        match self.serve_from_cache(cancel, &req) {
            Ok(Some(resp)) => return Ok(resp),
            Ok(None) => {}
            Err(e) => warn!(method = %req.method, url = %req.url, "cache lookup failed: {e}"),
        }

        // cache miss: persist the request, then go to the network
        let req_ref = self.s.store_schema(
            cancel,
            &Object::HttpRequest(Request {
                method: req.method.clone(),
                url: req.url.clone(),
                header: req.header.clone(),
                body: bref,
                trailer: Header::default(),
            }),
        )?;

        let resp = self.round_trip(&req, &bref)?;
        let status = resp.status().as_u16();
        let header = header_from_reqwest(resp.headers());

        if let Some(f) = &self.resp_filter {
            if !f(status, &header) {
                return Ok(HttpResponse {
                    status,
                    header,
                    body: Box::new(resp),
                    session_ref: None,
                });
            }
        }

        let rbody = self.store_body(cancel, Some(Box::new(resp)))?;
        let resp_ref = self.s.store_schema(
            cancel,
            &Object::HttpResponse(Response {
                status,
                header: header.clone(),
                body: rbody,
                trailer: Header::default(),
            }),
        )?;
        let sess_ref = self.s.store_schema(
            cancel,
            &Object::HttpSession(Session {
                request: req_ref.r#ref,
                response: resp_ref.r#ref,
            }),
        )?;

        let mut header = header;
        header.set(SESSION_REF_HEADER, &sess_ref.r#ref.to_string());
        let body = self.body_stream(cancel, &rbody)?;
        Ok(HttpResponse {
            status,
            header,
            body,
            session_ref: Some(sess_ref.r#ref),
        })
    }

    fn forward_uncached(&self, req: HttpRequest) -> Result<HttpResponse<'_>> {
        let mut builder = self
            .cli
            .request(parse_method(&req.method)?, req.url.clone())
            .headers(header_to_reqwest(&req.header)?);
        if let Some(body) = req.body {
            builder = builder.body(Body::new(body));
        }
        let resp = builder.send()?;
        let status = resp.status().as_u16();
        let header = header_from_reqwest(resp.headers());
        Ok(HttpResponse {
            status,
            header,
            body: Box::new(resp),
            session_ref: None,
        })
    }

    fn round_trip(
        &self,
        req: &HttpRequest,
        bref: &SizedRef,
    ) -> Result<reqwest::blocking::Response> {
        let mut builder = self
            .cli
            .request(parse_method(&req.method)?, req.url.clone())
            .headers(header_to_reqwest(&req.header)?);
        if !bref.r#ref.is_zero() && !bref.r#ref.is_empty() {
            let cancel = CancelToken::new();
            let (mut rc, _) = self.s.fetch_blob(&cancel, &bref.r#ref)?;
            let mut bytes = Vec::with_capacity(bref.size as usize);
            rc.read_to_end(&mut bytes)
                .map_err(|e| Error::from_io(e, "<body>"))?;
            builder = builder.body(bytes);
        }
        Ok(builder.send()?)
    }

    /// read a body stream into the store
    ///
    /// empty bodies use the empty ref without storing anything; bodies that
    /// fit in the peek buffer and already exist in the store are not
    /// re-written.
    fn store_body(
        &self,
        cancel: &CancelToken,
        rc: Option<Box<dyn Read + Send + '_>>,
    ) -> Result<SizedRef> {
        let mut rc = match rc {
            Some(rc) => rc,
            None => return Ok(SizedRef::new(Ref::empty(), 0)),
        };
        let mut peek = vec![0u8; PEEK_SIZE];
        let mut n = 0;
        let mut eof = false;
        while n < PEEK_SIZE {
            cancel.err()?;
            let read = rc
                .read(&mut peek[n..])
                .map_err(|e| Error::from_io(e, "<body>"))?;
            if read == 0 {
                eof = true;
                break;
            }
            n += read;
        }
        peek.truncate(n);
        if n == 0 {
            return Ok(SizedRef::new(Ref::empty(), 0));
        }
        if eof {
            // small body: when the blob exists already, skip the write
            let r = Ref::from_bytes(&peek);
            if let Ok(size) = self.s.stat_blob(cancel, &r) {
                return Ok(SizedRef::new(r, size));
            }
        }
        let mut joined = Cursor::new(peek).chain(rc);
        self.s
            .store_blob(cancel, &mut joined, &StoreConfig::default())
    }

    fn body_stream(&self, cancel: &CancelToken, sr: &SizedRef) -> Result<Box<dyn Read + Send + '_>> {
        if sr.r#ref.is_zero() || sr.r#ref.is_empty() {
            return Ok(Box::new(std::io::empty()));
        }
        let (rc, _) = self.s.fetch_blob(cancel, &sr.r#ref)?;
        Ok(rc)
    }

    fn serve_from_cache(
        &self,
        cancel: &CancelToken,
        req: &HttpRequest,
    ) -> Result<Option<HttpResponse<'_>>> {
        let reqs: Vec<_> = self
            .s
            .iterate_schema(cancel, &[schema::TYPE_HTTP_REQUEST.to_string()])
            .collect::<Result<_>>()?;
        for sr in reqs {
            let stored = match self.s.decode_schema(cancel, &sr.r#ref)? {
                Object::HttpRequest(r) => r,
                other => {
                    warn!("unexpected type: {}", other.type_name());
                    continue;
                }
            };
            if !self.request_matches(req, &stored) {
                continue;
            }
            // a matching request is only useful with a recorded response
            let (resp_ref, sess_ref) = match self.find_response_for(cancel, &sr.r#ref)? {
                Some(found) => found,
                None => continue,
            };
            let resp = match self.s.decode_schema(cancel, &resp_ref) {
                Ok(Object::HttpResponse(r)) => r,
                Ok(_) | Err(Error::NotSchema) | Err(Error::NotFound) => continue,
                Err(e) => return Err(e),
            };
            let mut header = resp.header.clone();
            header.set(SESSION_REF_HEADER, &sess_ref.to_string());
            let body = self.body_stream(cancel, &resp.body)?;
            return Ok(Some(HttpResponse {
                status: resp.status,
                header,
                body,
                session_ref: Some(sess_ref),
            }));
        }
        Ok(None)
    }

    fn find_response_for(
        &self,
        cancel: &CancelToken,
        req: &Ref,
    ) -> Result<Option<(Ref, Ref)>> {
        let sessions: Vec<_> = self
            .s
            .iterate_schema(cancel, &[schema::TYPE_HTTP_SESSION.to_string()])
            .collect::<Result<_>>()?;
        for sr in sessions {
            match self.s.decode_schema(cancel, &sr.r#ref)? {
                Object::HttpSession(s) if s.request == *req => {
                    return Ok(Some((s.response, sr.r#ref)));
                }
                Object::HttpSession(_) => {}
                other => warn!("unexpected type: {}", other.type_name()),
            }
        }
        Ok(None)
    }

    fn request_matches(&self, live: &HttpRequest, stored: &Request) -> bool {
        if live.method != stored.method {
            return false;
        }
        let (u1, u2) = (&live.url, &stored.url);
        if u1.scheme() != u2.scheme()
            || u1.host_str() != u2.host_str()
            || u1.path() != u2.path()
            || u1.as_str() != u2.as_str()
        {
            return false;
        }
        for h in &self.match_headers {
            let a = live.header.0.get(h);
            let b = stored.header.0.get(h);
            match (a, b) {
                (None, None) => {}
                (Some(a), Some(b)) if a == b => {}
                _ => return false,
            }
        }
        true
    }
}

fn parse_method(m: &str) -> Result<reqwest::Method> {
    reqwest::Method::from_bytes(m.as_bytes()).map_err(|e| Error::Config(e.to_string()))
}

fn header_to_reqwest(h: &Header) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (k, vals) in &h.0 {
        let name =
            HeaderName::from_bytes(k.as_bytes()).map_err(|e| Error::Config(e.to_string()))?;
        for v in vals {
            let value = HeaderValue::from_str(v).map_err(|e| Error::Config(e.to_string()))?;
            map.append(name.clone(), value);
        }
    }
    Ok(map)
}

fn header_from_reqwest(map: &HeaderMap) -> Header {
    let mut h = Header::default();
    for key in map.keys() {
        let name = canonical_key(key.as_str());
        for v in map.get_all(key) {
            if let Ok(v) = v.to_str() {
                h.append(&name, v);
            }
        }
    }
    h
}

/// canonical form of a header key: `x-cas-ref` -> `X-Cas-Ref`
fn canonical_key(k: &str) -> String {
    k.split('-')
        .map(|part| {
            let mut cs = part.chars();
            match cs.next() {
                Some(c) => c.to_uppercase().collect::<String>() + cs.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}
