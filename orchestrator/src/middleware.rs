/// CORS for the browser front end that starts runs, polls status and
/// downloads artifacts.
pub fn cors() -> warp::cors::Builder {
    warp::cors()
        .allow_any_origin()
        .allow_headers(vec![
            "User-Agent",
            "Origin",
            "Referer",
            "Access-Control-Request-Method",
            "Access-Control-Request-Headers",
            "Content-Type",
            "Accept",
            "Content-Length",
        ])
        .allow_methods(vec!["GET", "POST", "OPTIONS"])
        .expose_headers(vec!["Content-Disposition"])
}
