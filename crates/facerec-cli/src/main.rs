use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use clap::{Parser, Subcommand};
use reqwest::{Client, Method, RequestBuilder, Url};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "facerec", about = "Face enrollment and recognition CLI")]
struct Cli {
    /// Base URL of the facerecd server
    #[arg(long, env = "FACEREC_URL", default_value = "http://127.0.0.1:5000")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a face from an image file
    Enroll {
        /// Image file (JPEG, PNG, ...)
        image: PathBuf,
        /// Add the face to an existing person instead of creating one
        #[arg(long, conflicts_with_all = ["first_name", "last_name"])]
        person: Option<String>,
        #[arg(long, required_unless_present = "person")]
        first_name: Option<String>,
        #[arg(long, required_unless_present = "person")]
        last_name: Option<String>,
        #[arg(long)]
        national_code: Option<String>,
        #[arg(long)]
        employee_id: Option<String>,
        #[arg(long)]
        department: Option<String>,
        #[arg(long)]
        position: Option<String>,
        /// Remove the person's previous faces
        #[arg(long, requires = "person")]
        replace: bool,
    },
    /// Recognize the face in an image file
    Recognize {
        image: PathBuf,
    },
    /// List enrolled persons
    List,
    /// Show one person and their recent recognitions
    Show {
        id: String,
    },
    /// Enable or disable a person for recognition
    SetActive {
        id: String,
        #[arg(action = clap::ArgAction::Set)]
        active: bool,
    },
    /// Remove a person and all their faces
    Remove {
        id: String,
    },
    /// Remove one enrolled face of a person
    RemoveFace {
        person: String,
        enrollment: String,
    },
    /// Show recent recognition events
    Log {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Only events for this person
        #[arg(long)]
        person: Option<String>,
    },
    /// Show server status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let api = Api::new(&cli.server)?;

    match cli.command {
        Commands::Enroll {
            image,
            person,
            first_name,
            last_name,
            national_code,
            employee_id,
            department,
            position,
            replace,
        } => {
            let mut body = Map::new();
            body.insert("image".into(), json!(read_image(&image)?));
            body.insert("replace".into(), json!(replace));
            let fields = [
                ("person_id", person),
                ("first_name", first_name),
                ("last_name", last_name),
                ("national_code", national_code),
                ("employee_id", employee_id),
                ("department", department),
                ("position", position),
            ];
            for (key, value) in fields {
                if let Some(v) = value {
                    body.insert(key.into(), json!(v));
                }
            }

            let url = api.endpoint(&["api", "enroll"])?;
            let resp = api.send(Method::POST, url, Some(Value::Object(body))).await?;
            println!("Enrolled face {}", str_field(&resp, "enrollment_id"));
            println!("  person:  {}", str_field(&resp, "person_id"));
            println!("  quality: {:.3}", resp["quality"].as_f64().unwrap_or_default());
        }
        Commands::Recognize { image } => {
            let body = json!({ "image": read_image(&image)? });
            let resp = api.send(Method::POST, api.endpoint(&["api", "recognize"])?, Some(body)).await?;
            let confidence = resp["confidence"].as_f64().unwrap_or_default();
            if resp["matched"].as_bool().unwrap_or(false) {
                println!(
                    "Match: {} ({}) similarity {confidence:.3}",
                    person_name(&resp["person"]),
                    str_field(&resp, "person_id")
                );
            } else {
                println!("No match (best similarity {confidence:.3})");
            }
        }
        Commands::List => {
            let resp = api.send(Method::GET, api.endpoint(&["api", "persons"])?, None).await?;
            let persons = resp["persons"].as_array().cloned().unwrap_or_default();
            if persons.is_empty() {
                println!("No persons enrolled");
            }
            for p in &persons {
                let faces = p["enrollments"].as_array().map_or(0, Vec::len);
                let inactive = if p["is_active"].as_bool().unwrap_or(true) { "" } else { "  [inactive]" };
                println!("{}  {}  faces={faces}{inactive}", str_field(p, "id"), person_name(p));
            }
        }
        Commands::Show { id } => {
            let url = api.endpoint(&["api", "persons", id.as_str()])?;
            let resp = api.send(Method::GET, url, None).await?;
            println!("{}", serde_json::to_string_pretty(&resp["person"])?);
            let events = resp["recognitions"].as_array().cloned().unwrap_or_default();
            println!("Recent recognitions: {}", events.len());
            for e in &events {
                println!(
                    "  {}  similarity {:.3}",
                    str_field(e, "created_at"),
                    e["similarity"].as_f64().unwrap_or_default()
                );
            }
        }
        Commands::SetActive { id, active } => {
            let body = json!({ "is_active": active });
            let url = api.endpoint(&["api", "persons", id.as_str()])?;
            api.send(Method::PUT, url, Some(body)).await?;
            println!("Person {id} is now {}", if active { "active" } else { "inactive" });
        }
        Commands::Remove { id } => {
            let url = api.endpoint(&["api", "persons", id.as_str()])?;
            let resp = api.send(Method::DELETE, url, None).await?;
            println!("{}", str_field(&resp, "message"));
        }
        Commands::RemoveFace { person, enrollment } => {
            let url = api.endpoint(&[
                "api",
                "persons",
                person.as_str(),
                "enrollments",
                enrollment.as_str(),
            ])?;
            let resp = api.send(Method::DELETE, url, None).await?;
            println!("{}", str_field(&resp, "message"));
        }
        Commands::Log { limit, person } => {
            let mut url = api.endpoint(&["api", "recognitions"])?;
            url.query_pairs_mut().append_pair("limit", &limit.to_string());
            if let Some(person) = &person {
                url.query_pairs_mut().append_pair("person_id", person);
            }
            let resp = api.send(Method::GET, url, None).await?;
            for e in resp["recognitions"].as_array().cloned().unwrap_or_default() {
                let who = e["person_id"].as_str().unwrap_or("-");
                let outcome = if e["matched"].as_bool().unwrap_or(false) { "match" } else { "no match" };
                println!(
                    "{}  {outcome:<8}  {who}  {:.3}",
                    str_field(&e, "created_at"),
                    e["similarity"].as_f64().unwrap_or_default()
                );
            }
        }
        Commands::Status => {
            let resp = api.send(Method::GET, api.endpoint(&["api", "health"])?, None).await?;
            println!("facerecd {}: {}", str_field(&resp, "version"), str_field(&resp, "status"));
            println!("  models:      {}", str_field(&resp, "models"));
            println!("  persons:     {}", resp["persons"]);
            println!("  enrollments: {}", resp["enrollments"]);
        }
    }

    Ok(())
}

struct Api {
    client: Client,
    base: Url,
}

impl Api {
    fn new(server: &str) -> Result<Self> {
        let base = Url::parse(server).with_context(|| format!("invalid server URL {server}"))?;
        if base.cannot_be_a_base() {
            bail!("invalid server URL {server}");
        }
        Ok(Self {
            client: Client::new(),
            base,
        })
    }

    /// Server URL with `segments` appended, each one percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow!("invalid server URL {}", self.base))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client.request(method, url)
    }

    /// Send a request and unwrap the `success` envelope.
    async fn send(&self, method: Method, url: Url, body: Option<Value>) -> Result<Value> {
        tracing::debug!(%url, "sending request");
        let mut req = self.request(method, url);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req
            .send()
            .await
            .with_context(|| format!("cannot reach facerecd at {}", self.base))?;
        let status = resp.status();
        let value: Value = resp
            .json()
            .await
            .with_context(|| format!("unexpected response ({status})"))?;

        if value["success"] == Value::Bool(false) || !status.is_success() {
            let message = value["error"].as_str().unwrap_or("request failed");
            bail!("{message} ({status})");
        }
        Ok(value)
    }
}

fn read_image(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(STANDARD.encode(bytes))
}

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value[key].as_str().unwrap_or("-")
}

fn person_name(person: &Value) -> String {
    format!("{} {}", str_field(person, "first_name"), str_field(person, "last_name"))
}
