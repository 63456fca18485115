//! Typed extractors: pull structured values out of a request context.

use serde::de::DeserializeOwned;

use crate::http::{RequestContext, Response};

/// A value that can be produced from a request. Failures convert into the
/// response sent to the client.
pub trait FromRequest: Sized {
    type Error: Into<Response>;

    fn from_request(ctx: &RequestContext) -> Result<Self, Self::Error>;
}

impl RequestContext {
    pub fn extract<T: FromRequest>(&self) -> Result<T, T::Error> {
        T::from_request(self)
    }
}

/// JSON request body.
#[derive(Debug)]
pub struct Json<T>(pub T);

impl<T: DeserializeOwned> FromRequest for Json<T> {
    type Error = Response;

    fn from_request(ctx: &RequestContext) -> Result<Self, Self::Error> {
        match serde_json::from_slice(&ctx.body) {
            Ok(value) => Ok(Json(value)),
            Err(e) => Err(Response::text(400, format!("invalid JSON body: {e}"))),
        }
    }
}

/// Deserialized query string. Array-valued fields (`tag[]=a&tag[]=b`)
/// surface as sequences.
pub struct Query<T>(pub T);

impl<T: DeserializeOwned> FromRequest for Query<T> {
    type Error = Response;

    fn from_request(ctx: &RequestContext) -> Result<Self, Self::Error> {
        decode_map(&ctx.query_map())
            .map(Query)
            .map_err(|e| Response::text(400, format!("invalid query string: {e}")))
    }
}

/// Deserialized `application/x-www-form-urlencoded` body.
#[derive(Debug)]
pub struct Form<T>(pub T);

impl<T: DeserializeOwned> FromRequest for Form<T> {
    type Error = Response;

    fn from_request(ctx: &RequestContext) -> Result<Self, Self::Error> {
        let map = ctx
            .form()
            .ok_or_else(|| Response::text(400, "expected a urlencoded form body"))?;
        decode_map(&map)
            .map(Form)
            .map_err(|e| Response::text(400, format!("invalid form body: {e}")))
    }
}

fn decode_map<T: DeserializeOwned>(map: &crate::query::QueryMap) -> serde_json::Result<T> {
    let mut object = serde_json::Map::new();
    for (key, value) in map.iter() {
        let json = match value {
            crate::query::Value::One(s) => serde_json::Value::String(s.clone()),
            crate::query::Value::Many(vs) => serde_json::Value::Array(
                vs.iter().map(|v| serde_json::Value::String(v.clone())).collect(),
            ),
        };
        object.insert(key.to_string(), json);
    }
    serde_json::from_value(serde_json::Value::Object(object))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct CreateUser {
        name: String,
        role: Option<String>,
    }

    #[test]
    fn json_extractor() {
        let mut ctx = RequestContext::new(Method::Post, "/users");
        ctx.body = bytes::Bytes::from_static(br#"{"name": "ada"}"#);
        let Json(user): Json<CreateUser> = ctx.extract().unwrap();
        assert_eq!(user, CreateUser { name: "ada".into(), role: None });

        ctx.body = bytes::Bytes::from_static(b"not json");
        let err = ctx.extract::<Json<CreateUser>>().unwrap_err();
        assert_eq!(err.status, 400);
    }

    #[derive(Debug, Deserialize)]
    struct Search {
        q: String,
        #[serde(default)]
        tag: Vec<String>,
    }

    #[test]
    fn query_extractor_with_arrays() {
        let mut ctx = RequestContext::new(Method::Get, "/search");
        ctx.query = Some("q=rust&tag[]=web&tag[]=http".to_string());
        let Query(search): Query<Search> = ctx.extract().unwrap();
        assert_eq!(search.q, "rust");
        assert_eq!(search.tag, ["web", "http"]);
    }

    #[test]
    fn form_extractor_requires_content_type() {
        let mut ctx = RequestContext::new(Method::Post, "/login");
        ctx.body = bytes::Bytes::from_static(b"name=ada");
        let err = ctx.extract::<Form<CreateUser>>().unwrap_err();
        assert_eq!(err.status, 400);

        ctx.headers.set("content-type", "application/x-www-form-urlencoded");
        let Form(user): Form<CreateUser> = ctx.extract().unwrap();
        assert_eq!(user.name, "ada");
    }
}
