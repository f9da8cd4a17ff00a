//! Ready made chains for the common cases: a curl-like request, the origin
//! answer, and what the system under test is expected to make of both.

use crate::{
    chain::MessageChain,
    message::{date::http_date_now, HeaderList, Message},
};

const SAMPLE_BODY: &str = "<html>\r\n\
<head>\r\n  <title>An Example Page</title>\r\n</head>\r\n\
<body>\r\n  Hello World, this is a very simple HTML document.\r\n</body>\r\n\
</html>\r\n";

const LAST_MODIFIED: &str = "Mon, 12 Dec 2016 13:59:39 GMT";

/// `Server` sent by the harness origin
pub const ORIGIN_SERVER: &str = "Deproxy Server";

/// What the system under test adds on each side
#[derive(Debug, Clone)]
pub struct Stock {
    pub host: String,
    /// added to requests forwarded to the origin
    pub request_additions: HeaderList,
    /// added to responses served to the client, replacing the origin's
    /// `Server` when they carry one
    pub response_additions: HeaderList,
    /// the `Server` of the responses the intermediary generates itself
    pub server: Option<String>,
}

impl Stock {
    /// an intermediary forwarding everything unchanged
    pub fn transparent() -> Self {
        Stock {
            host: "localhost".to_owned(),
            request_additions: HeaderList::new(),
            response_additions: HeaderList::new(),
            server: None,
        }
    }

    /// a proxy identifying itself as `name` in `Via` and `Server`, and
    /// reporting `client_ip` in `X-Forwarded-For`
    pub fn proxy(host: &str, client_ip: &str, name: &str) -> Self {
        let via = format!("1.1 {name}");
        Stock {
            host: host.to_owned(),
            request_additions: [("Via", via.as_str()), ("X-Forwarded-For", client_ip)]
                .into_iter()
                .collect(),
            response_additions: [("Server", name), ("Via", via.as_str())]
                .into_iter()
                .collect(),
            server: Some(name.to_owned()),
        }
    }

    /// Request and responses for `method`. A step that is not forwarded is
    /// served from cache and carries an `Age`.
    pub fn base(&self, method: &str, uri: &str, forward: bool) -> MessageChain {
        let date = http_date_now();

        let mut request_headers: Vec<(String, String)> = vec![
            ("Host".into(), self.host.clone()),
            ("User-Agent".into(), "curl/7.53.1".into()),
            ("Connection".into(), "keep-alive".into()),
            ("Accept".into(), "*/*".into()),
        ];
        let mut request_body = "";
        let mut status = 200;
        let mut response_headers: Vec<(String, String)> =
            vec![("Connection".into(), "keep-alive".into())];
        let mut response_body = "";
        let mut response_additions = self.response_additions.clone();

        match method {
            "PURGE" => {
                response_headers.push(("Content-Length".into(), "0".into()));
                response_additions.retain(|name, _| name.eq_ignore_ascii_case("server"));
            }
            "HEAD" | "GET" => {
                response_headers.extend([
                    ("Content-Length".into(), SAMPLE_BODY.len().to_string()),
                    ("Content-type".into(), "text/html".into()),
                    ("Last-Modified".into(), LAST_MODIFIED.into()),
                ]);
                if method == "GET" {
                    response_body = SAMPLE_BODY;
                }
            }
            "POST" => {
                request_body = "--boundary\r\n\
                    Content-Disposition: form-data; name=\"field1\"\r\n\
                    \r\n\
                    value1\r\n\
                    --boundary\r\n\
                    Content-Disposition: form-data; name=\"field2\"; filename=\"example.txt\"\r\n\
                    \r\n\
                    value2\r\n";
                request_headers.extend([
                    (
                        "Content-type".into(),
                        "multipart/form-data;boundary=\"boundary\"".into(),
                    ),
                    ("Content-Length".into(), request_body.len().to_string()),
                ]);
                status = 204;
            }
            "PUT" => {
                request_headers.extend([
                    ("Content-Length".into(), SAMPLE_BODY.len().to_string()),
                    ("Content-type".into(), "text/html".into()),
                ]);
                request_body = SAMPLE_BODY;
                status = 204;
            }
            "DELETE" => status = 204,
            _ => response_headers.push(("Content-Length".into(), "0".into())),
        }

        let request = Message::request(method, uri)
            .headers(request_headers.iter().cloned())
            .body(request_body);

        let mut expected = Message::response(status).headers(response_headers.iter().cloned());
        if !response_additions.contains("server") {
            expected.headers.add("Server", ORIGIN_SERVER);
        }
        expected.headers.extend(response_additions.iter());
        if !forward {
            expected.headers.add("Age", "0");
        }
        let expected = expected.header("Date", date.as_str()).body(response_body);

        let mut step = MessageChain::new(request.clone(), Some(expected));
        if forward {
            let mut forwarded = request;
            forwarded.headers.extend(self.request_additions.iter());
            let origin = Message::response(status)
                .headers(response_headers.iter().cloned())
                .header("Server", ORIGIN_SERVER)
                .header("Date", date.as_str())
                .body(response_body);
            step = step.forwarded(forwarded, origin);
        }
        step
    }

    /// `base` for GET with a chunked response body
    pub fn base_chunked(&self, uri: &str) -> MessageChain {
        let mut step = self.base("GET", uri, true);
        for response in [step.response.as_mut(), step.server_response.as_mut()]
            .into_iter()
            .flatten()
        {
            response.headers.remove_all("content-length");
            response.headers.add("Transfer-Encoding", "chunked");
            response.body = b"4\r\n1234\r\n0\r\n".to_vec();
        }
        step
    }

    /// `count` identical forwarded steps
    pub fn proxy_repeated(&self, count: usize, method: &str, uri: &str) -> Vec<MessageChain> {
        vec![self.base(method, uri, true); count]
    }

    /// one forwarded step followed by `count - 1` steps served from cache
    pub fn cache_repeated(&self, count: usize, method: &str, uri: &str) -> Vec<MessageChain> {
        let mut steps = Vec::with_capacity(count);
        if count > 0 {
            steps.push(self.base(method, uri, true));
            steps.extend(vec![self.base(method, uri, false); count - 1]);
        }
        steps
    }

    fn error_response(&self, status: u16, date: Option<&str>, connection: Option<&str>) -> Message {
        let date = date.map_or_else(http_date_now, str::to_owned);
        let mut response = Message::response(status).header("Content-Length", "0");
        if let Some(server) = &self.server {
            response.headers.add("Server", server.as_str());
        }
        if let Some(connection) = connection {
            response.headers.add("Connection", connection);
        }
        response.header("Date", date)
    }

    pub fn response_400(&self, date: Option<&str>, connection: Option<&str>) -> Message {
        self.error_response(400, date, connection)
    }

    pub fn response_403(&self, date: Option<&str>, connection: Option<&str>) -> Message {
        self.error_response(403, date, connection)
    }

    pub fn response_500(&self) -> Message {
        self.error_response(500, None, Some("keep-alive"))
    }

    pub fn response_502(&self) -> Message {
        self.error_response(502, None, Some("keep-alive"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::h1::{parse_request, parse_response};
    use crate::message::Parsed;

    #[test]
    fn transparent_base_forwards_unchanged() {
        let step = Stock::transparent().base("GET", "/", true);
        assert_eq!(step.forwarded_request.as_ref(), Some(&step.request));
        assert_eq!(step.response, step.server_response);

        let response = step.response.unwrap();
        assert_eq!(response.body, SAMPLE_BODY.as_bytes());
        assert_eq!(
            response.headers.get("content-length"),
            Some(SAMPLE_BODY.len().to_string().as_str())
        );
        let bytes = response.serialize();
        assert_eq!(parse_response(&bytes, false), Parsed::Complete(response, bytes.len()));
    }

    #[test]
    fn proxy_additions() {
        let stock = Stock::proxy("example.com", "10.0.0.1", "tandem-proxy");
        let step = stock.base("GET", "/", true);
        let forwarded = step.forwarded_request.unwrap();
        assert_eq!(forwarded.headers.get("via"), Some("1.1 tandem-proxy"));
        assert_eq!(forwarded.headers.get("x-forwarded-for"), Some("10.0.0.1"));
        assert!(!step.request.headers.contains("via"));

        let response = step.response.unwrap();
        assert_eq!(response.headers.get_all("server"), vec!["tandem-proxy"]);
        assert_eq!(
            step.server_response.unwrap().headers.get("server"),
            Some(ORIGIN_SERVER)
        );

        let cached = stock.base("GET", "/", false);
        assert!(!cached.is_forwarded());
        assert_eq!(cached.response.unwrap().headers.get("age"), Some("0"));
    }

    #[test]
    fn post_body_is_framed() {
        let step = Stock::transparent().base("POST", "/upload", true);
        let bytes = step.request.serialize();
        assert_eq!(
            parse_request(&bytes),
            Parsed::Complete(step.request.clone(), bytes.len())
        );
        assert_eq!(step.response.unwrap().status(), Some(204));
    }

    #[test]
    fn chunked_response() {
        let step = Stock::transparent().base_chunked("/");
        let response = step.response.unwrap();
        assert!(response.is_chunked());
        assert!(!response.headers.contains("content-length"));
        assert_eq!(response.decoded_body(), b"1234");
        let bytes = response.serialize();
        assert!(bytes.ends_with(b"4\r\n1234\r\n0\r\n\r\n"));
    }

    #[test]
    fn repeated_chains() {
        let stock = Stock::transparent();
        assert_eq!(stock.proxy_repeated(3, "GET", "/").len(), 3);
        let cached = stock.cache_repeated(3, "GET", "/");
        assert!(cached[0].is_forwarded());
        assert!(cached[1..].iter().all(|step| !step.is_forwarded()));
        assert!(stock.cache_repeated(0, "GET", "/").is_empty());
    }

    #[test]
    fn error_responses() {
        let stock = Stock::proxy("localhost", "127.0.0.1", "tandem-proxy");
        let response = stock.response_403(Some("Mon, 12 Dec 2016 13:59:39 GMT"), Some("close"));
        assert_eq!(response.status(), Some(403));
        assert_eq!(response.headers.get("connection"), Some("close"));
        assert_eq!(response.headers.get("date"), Some("Mon, 12 Dec 2016 13:59:39 GMT"));
        assert_eq!(response.headers.get("server"), Some("tandem-proxy"));
        assert_eq!(stock.response_502().status(), Some(502));
        assert!(!Stock::transparent().response_400(None, None).headers.contains("server"));
    }
}
