use serde::{Deserialize, Serialize};

/// Entry of the remote `/cidades/` catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct City {
    pub id: i64,
    #[serde(rename = "nome")]
    pub name: String,
}

/// Entry of the remote `/cidades/{id}/bairros/` catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Neighborhood {
    pub id: i64,
    #[serde(rename = "nome")]
    pub name: String,
}

/// A pole as returned by `GET /postes/`.
///
/// The server representation is loosely specified, so everything except the
/// id is optional and unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemotePoste {
    pub id: i64,
    #[serde(rename = "cidade", default)]
    pub city: Option<serde_json::Value>,
    #[serde(rename = "bairro", default)]
    pub neighborhood: Option<serde_json::Value>,
    #[serde(rename = "zonautm", default)]
    pub utm_zone: Option<i64>,
    #[serde(rename = "localizacao_utm_x", default)]
    pub utm_easting: Option<f64>,
    #[serde(rename = "localizacao_utm_y", default)]
    pub utm_northing: Option<f64>,
    #[serde(rename = "observacoes", default)]
    pub notes: Option<String>,
    #[serde(rename = "foto", default)]
    pub photo_url: Option<String>,
}
